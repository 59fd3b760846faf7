//! Subject admission, liveness and departure.

use super::{AppState, ExperimentCore};
use crate::protocol::{MonitorReply, SubjectUpdate};
use crate::types::*;
use tokio::sync::oneshot;

impl ExperimentCore {
    /// Park a subject's long-poll. Admission is open to anyone while the
    /// monitor is accepting, and stays open to already-admitted identities
    /// afterwards (a reconnect must not lock a subject out mid-test).
    pub fn pend(
        &mut self,
        identity: &ConnectionId,
        real_id: Option<RealId>,
    ) -> Result<oneshot::Receiver<SubjectUpdate>, SubjectUpdate> {
        if self.registry.is_admitted(identity) || self.accepting_subjects {
            let real = real_id
                .or_else(|| self.registry.real_id(identity))
                .unwrap_or(0);
            Ok(self.registry.park(identity, real))
        } else {
            Err(SubjectUpdate::ClientsNotAccepted)
        }
    }

    /// Remove an identity everywhere, and unblock a waiting monitor if the
    /// cohort just drained to empty.
    pub fn depart(&mut self, identity: &ConnectionId) {
        if self.registry.evict(identity) {
            self.number_of_subjects = self.registry.admitted_count() as u32;
            tracing::info!("Subject {} left", identity);
        }
        self.resolve_monitor_if_drained();
    }

    /// Evict everyone whose liveness window lapsed; called by the reaper.
    pub fn sweep_liveness(&mut self) -> Vec<ConnectionId> {
        let timeout = match self.config.kill_timeout {
            Some(t) => t,
            None => return Vec::new(),
        };
        let evicted = self.registry.sweep(timeout);
        if !evicted.is_empty() {
            self.number_of_subjects = self.registry.admitted_count() as u32;
            tracing::info!("Evicted {} unresponsive subject(s)", evicted.len());
            self.resolve_monitor_if_drained();
        }
        evicted
    }

    pub(crate) fn resolve_monitor_if_drained(&mut self) {
        if self.registry.admitted_count() == 0 && self.registry.monitor_waiting() {
            self.registry.resolve_monitor(MonitorReply::Terminal);
        }
    }
}

impl AppState {
    pub async fn pend(
        &self,
        identity: &ConnectionId,
        real_id: Option<RealId>,
    ) -> Result<oneshot::Receiver<SubjectUpdate>, SubjectUpdate> {
        self.core.lock().await.pend(identity, real_id)
    }

    /// Liveness ping. With eviction disabled this is a plain ack.
    pub async fn alive(&self, identity: &ConnectionId) {
        if self.config.kill_timeout.is_some() {
            self.core.lock().await.registry.touch(identity);
        }
    }

    pub async fn leave(&self, identity: &ConnectionId) {
        self.core.lock().await.depart(identity);
    }
}
