//! Command dispatch: the bridge between the transport adapter and the core.
//!
//! Monitor authentication is checked here before any privileged action
//! reaches the state machine; a failed check returns the sentinel token and
//! mutates nothing.

use crate::protocol::*;
use crate::state::{AppState, EndTestOutcome, SubmitOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// How the transport should answer a command.
pub enum Outcome {
    /// Personalized JSON payload
    Subject(SubjectUpdate),
    /// Public counts JSON
    Info(ClientInfoReply),
    /// Plain-text monitor token
    Monitor(MonitorReply),
    /// Long-poll: answer with whatever eventually arrives on the channel
    ParkedSubject(oneshot::Receiver<SubjectUpdate>),
    /// Monitor end-of-test wait
    ParkedMonitor(oneshot::Receiver<MonitorReply>),
    /// Plain `+` acknowledgment
    Ack,
    /// Not-found-equivalent rejection
    NotFound,
}

pub async fn handle_command(cmd: Command, state: &Arc<AppState>) -> Outcome {
    match cmd {
        Command::Pend { identity, real_id } => match state.pend(&identity, real_id).await {
            Ok(rx) => Outcome::ParkedSubject(rx),
            Err(update) => Outcome::Subject(update),
        },

        Command::Submit {
            identity,
            real_id,
            choice,
        } => match state.submit(&identity, real_id, choice).await {
            SubmitOutcome::NotFound => Outcome::NotFound,
            // a duplicate is acknowledged exactly like a fresh submission
            SubmitOutcome::Duplicate | SubmitOutcome::Accepted { .. } => Outcome::Ack,
        },

        Command::ClientInfo => Outcome::Info(state.core.lock().await.client_info()),

        Command::Alive { identity } => {
            state.alive(&identity).await;
            Outcome::Ack
        }

        Command::Leave { identity } => {
            state.leave(&identity).await;
            Outcome::Ack
        }

        Command::GraphInfo { identity, real_id } => {
            match state.core.lock().await.graph_info(&identity, real_id) {
                Some(update) => Outcome::Subject(update),
                None => Outcome::NotFound,
            }
        }

        Command::MonitorRequest { monitor_id } => {
            let challenge = state
                .core
                .lock()
                .await
                .monitors
                .issue_challenge(&monitor_id);
            Outcome::Monitor(MonitorReply::Challenge(challenge))
        }

        Command::MonitorRespond {
            monitor_id,
            response,
            action,
            sync,
        } => {
            if sync {
                wait_for_roster_sync(state).await;
            }
            handle_monitor_action(state, &monitor_id, &response, action).await
        }
    }
}

/// A monitor command carrying the `sync` attribute waits for the pending
/// connections to catch up with the cohort, retrying with a short backoff.
/// When the budget runs out the roster is rebuilt from whoever is actually
/// connected; best-effort only.
async fn wait_for_roster_sync(state: &Arc<AppState>) {
    for _ in 0..state.config.max_sync_attempts {
        {
            let core = state.core.lock().await;
            if core.registry.parked_count() as u32 == core.number_of_subjects {
                return;
            }
        }
        tracing::info!("Subject roster not settled, retrying...");
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    let mut core = state.core.lock().await;
    core.registry.resync_from_parked();
    core.number_of_subjects = core.registry.admitted_count() as u32;
    tracing::warn!("Roster sync budget exhausted; resynchronized from pending connections");
}

async fn handle_monitor_action(
    state: &Arc<AppState>,
    monitor_id: &str,
    response: &str,
    action: MonitorAction,
) -> Outcome {
    let mut core = state.core.lock().await;
    if !core.monitors.verify(monitor_id, response) {
        return Outcome::Monitor(MonitorReply::Unauthenticated);
    }

    match action {
        MonitorAction::Test => Outcome::Monitor(MonitorReply::Success),
        MonitorAction::Leave => Outcome::Monitor(MonitorReply::Ok),
        MonitorAction::KillEverything => {
            core.kill_everything();
            Outcome::Monitor(MonitorReply::Ok)
        }
        MonitorAction::CheckStatus => Outcome::Monitor(MonitorReply::Status(core.status_string())),
        MonitorAction::StartPractice => {
            core.practice_mode = true;
            Outcome::Monitor(MonitorReply::Ok)
        }
        MonitorAction::EndPractice => {
            core.practice_mode = false;
            Outcome::Monitor(MonitorReply::Ok)
        }
        MonitorAction::StartAccepting => {
            core.accepting_subjects = true;
            Outcome::Monitor(MonitorReply::Ok)
        }
        MonitorAction::StopAccepting => {
            core.accepting_subjects = false;
            Outcome::Monitor(MonitorReply::Ok)
        }
        MonitorAction::StartTest => {
            core.start_test();
            Outcome::Monitor(MonitorReply::Ok)
        }
        MonitorAction::EndTest => match core.end_test() {
            EndTestOutcome::Immediate(reply) => Outcome::Monitor(reply),
            EndTestOutcome::Parked(rx) => Outcome::ParkedMonitor(rx),
        },
        // authenticated but unrecognized: acknowledged without effect
        MonitorAction::Unknown => Outcome::Monitor(MonitorReply::Ok),
    }
}
