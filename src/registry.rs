//! Tracking of pending long-poll connections and the admitted roster.
//!
//! Every waiting subject is a parked oneshot sender; a broadcast drains the
//! parked set and answers each identity exactly once. The admitted set is the
//! cohort allowed into the test once admission closes, together with the
//! global id each subject carried when first admitted (kept for the results
//! export). The monitor's end-of-test response can be parked here too.

use crate::protocol::{MonitorReply, SubjectUpdate};
use crate::types::{ConnectionId, RealId};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A subject admitted into the test.
#[derive(Debug, Clone)]
pub struct AdmittedSubject {
    pub id: ConnectionId,
    /// The real id the subject carried when first admitted; exported as the
    /// GlobalID column and never reassigned afterwards
    pub global_id: RealId,
}

/// One parked long-poll connection.
pub struct ParkedClient {
    pub id: ConnectionId,
    pub real_id: RealId,
    tx: oneshot::Sender<SubjectUpdate>,
}

impl ParkedClient {
    /// Answer this connection. A dead receiver just means the browser went
    /// away; the payload is dropped.
    pub fn respond(self, update: SubjectUpdate) {
        if self.tx.send(update).is_err() {
            tracing::debug!("Parked client {} vanished before broadcast", self.id);
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    parked: Vec<ParkedClient>,
    admitted: Vec<AdmittedSubject>,
    /// Current round's real-id assignment, updated on pend and on reshuffle
    real_ids: HashMap<ConnectionId, RealId>,
    last_seen: HashMap<ConnectionId, Instant>,
    monitor_waiter: Option<oneshot::Sender<MonitorReply>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an identity if it is new, then park its long-poll. If the
    /// identity already has a parked responder the old one is answered with
    /// `Superseded` rather than silently dropped.
    pub fn park(&mut self, id: &ConnectionId, real_id: RealId) -> oneshot::Receiver<SubjectUpdate> {
        if !self.is_admitted(id) {
            self.admitted.push(AdmittedSubject {
                id: id.clone(),
                global_id: real_id,
            });
        }
        self.real_ids.insert(id.clone(), real_id);
        self.last_seen.entry(id.clone()).or_insert_with(Instant::now);

        if let Some(pos) = self.parked.iter().position(|c| &c.id == id) {
            tracing::warn!("Identity {} re-parked while already pending", id);
            let old = self.parked.remove(pos);
            old.respond(SubjectUpdate::Superseded);
        }

        let (tx, rx) = oneshot::channel();
        self.parked.push(ParkedClient {
            id: id.clone(),
            real_id,
            tx,
        });
        rx
    }

    pub fn is_admitted(&self, id: &ConnectionId) -> bool {
        self.admitted.iter().any(|s| &s.id == id)
    }

    pub fn admitted_count(&self) -> usize {
        self.admitted.len()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Identities currently admitted, in admission order.
    pub fn admitted(&self) -> &[AdmittedSubject] {
        &self.admitted
    }

    /// The GlobalID column value for an admitted identity.
    pub fn global_id(&self, id: &ConnectionId) -> Option<RealId> {
        self.admitted
            .iter()
            .find(|s| &s.id == id)
            .map(|s| s.global_id)
    }

    /// Last-known real id for an identity (current round's assignment).
    pub fn real_id(&self, id: &ConnectionId) -> Option<RealId> {
        self.real_ids.get(id).copied()
    }

    pub fn assign_real_id(&mut self, id: &ConnectionId, real_id: RealId) {
        self.real_ids.insert(id.clone(), real_id);
    }

    /// Refresh an identity's liveness window. Unknown identities are
    /// ignored: a ping racing an eviction must not resurrect the subject.
    pub fn touch(&mut self, id: &ConnectionId) {
        if let Some(seen) = self.last_seen.get_mut(id) {
            *seen = Instant::now();
        } else if self.is_admitted(id) {
            self.last_seen.insert(id.clone(), Instant::now());
        }
    }

    /// Drop an identity from every tracking set. Evicting an identity that
    /// is already gone is a no-op.
    pub fn evict(&mut self, id: &ConnectionId) -> bool {
        let mut removed = false;
        if let Some(pos) = self.parked.iter().position(|c| &c.id == id) {
            self.parked.remove(pos);
            removed = true;
        }
        if let Some(pos) = self.admitted.iter().position(|s| &s.id == id) {
            self.admitted.remove(pos);
            removed = true;
        }
        self.real_ids.remove(id);
        self.last_seen.remove(id);
        removed
    }

    /// Evict every identity whose last liveness ping is older than
    /// `timeout`; returns the evicted ids.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.evict(id);
        }
        stale
    }

    /// Answer every parked connection exactly once, with a payload built
    /// per identity. Constant messages are just `|_, _| payload.clone()`.
    pub fn broadcast_all(&mut self, mut builder: impl FnMut(&ConnectionId, RealId) -> SubjectUpdate) {
        for client in self.parked.drain(..) {
            let update = builder(&client.id, client.real_id);
            client.respond(update);
        }
    }

    /// Take the parked set for a broadcast that needs wider state access
    /// than a closure can borrow.
    pub fn drain_parked(&mut self) -> Vec<ParkedClient> {
        std::mem::take(&mut self.parked)
    }

    /// Park the monitor's end-of-test response.
    pub fn park_monitor(&mut self) -> oneshot::Receiver<MonitorReply> {
        let (tx, rx) = oneshot::channel();
        if self.monitor_waiter.replace(tx).is_some() {
            tracing::warn!("Monitor end-of-test response re-parked");
        }
        rx
    }

    pub fn monitor_waiting(&self) -> bool {
        self.monitor_waiter.is_some()
    }

    /// Resolve the waiting monitor, exactly once; later calls are no-ops.
    pub fn resolve_monitor(&mut self, reply: MonitorReply) -> bool {
        match self.monitor_waiter.take() {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    tracing::warn!("Monitor went away before end-of-test resolution");
                }
                true
            }
            None => false,
        }
    }

    /// Best-effort roster rebuild from the currently parked connections,
    /// for the monitor sync fallback.
    pub fn resync_from_parked(&mut self) {
        let parked_ids: Vec<(ConnectionId, RealId)> = self
            .parked
            .iter()
            .map(|c| (c.id.clone(), c.real_id))
            .collect();
        self.admitted
            .retain(|s| parked_ids.iter().any(|(id, _)| id == &s.id));
        for (id, real_id) in parked_ids {
            if !self.is_admitted(&id) {
                self.admitted.push(AdmittedSubject {
                    id: id.clone(),
                    global_id: real_id,
                });
            }
        }
    }

    /// Forget everything, including any parked monitor.
    pub fn clear(&mut self) {
        self.parked.clear();
        self.admitted.clear();
        self.real_ids.clear();
        self.last_seen.clear();
        self.monitor_waiter = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_park_and_broadcast_exactly_once() {
        let mut registry = ConnectionRegistry::new();
        let rx1 = registry.park(&"a".to_string(), 1);
        let rx2 = registry.park(&"b".to_string(), 2);
        assert_eq!(registry.parked_count(), 2);
        assert_eq!(registry.admitted_count(), 2);

        registry.broadcast_all(|_, _| SubjectUpdate::End);
        assert_eq!(registry.parked_count(), 0);
        assert_eq!(rx1.await.unwrap(), SubjectUpdate::End);
        assert_eq!(rx2.await.unwrap(), SubjectUpdate::End);
    }

    #[tokio::test]
    async fn test_repark_supersedes_previous() {
        let mut registry = ConnectionRegistry::new();
        let old = registry.park(&"a".to_string(), 1);
        let fresh = registry.park(&"a".to_string(), 1);
        assert_eq!(registry.parked_count(), 1);
        assert_eq!(old.await.unwrap(), SubjectUpdate::Superseded);

        registry.broadcast_all(|_, _| SubjectUpdate::Kill);
        assert_eq!(fresh.await.unwrap(), SubjectUpdate::Kill);
    }

    #[test]
    fn test_evict_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        registry.park(&"a".to_string(), 1);
        assert!(registry.evict(&"a".to_string()));
        assert!(!registry.evict(&"a".to_string()));
        assert_eq!(registry.admitted_count(), 0);
    }

    #[test]
    fn test_sweep_evicts_stale_only() {
        let mut registry = ConnectionRegistry::new();
        registry.park(&"a".to_string(), 1);
        registry.park(&"b".to_string(), 2);

        // backdate a's last ping
        registry
            .last_seen
            .insert("a".to_string(), Instant::now() - Duration::from_secs(60));

        let evicted = registry.sweep(Duration::from_secs(5));
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(!registry.is_admitted(&"a".to_string()));
        assert!(registry.is_admitted(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_monitor_resolved_exactly_once() {
        let mut registry = ConnectionRegistry::new();
        let rx = registry.park_monitor();
        assert!(registry.monitor_waiting());
        assert!(registry.resolve_monitor(MonitorReply::Terminal));
        assert!(!registry.resolve_monitor(MonitorReply::Terminal));
        assert_eq!(rx.await.unwrap(), MonitorReply::Terminal);
    }

    #[test]
    fn test_global_id_is_sticky() {
        let mut registry = ConnectionRegistry::new();
        registry.park(&"a".to_string(), 3);
        registry.broadcast_all(|_, _| SubjectUpdate::End);
        // re-pend with a reshuffled real id; the global id stays
        registry.park(&"a".to_string(), 1);
        assert_eq!(registry.global_id(&"a".to_string()), Some(3));
        assert_eq!(registry.real_id(&"a".to_string()), Some(1));
    }
}
