use econlab::config::LabConfig;
use econlab::handlers::{handle_command, Outcome};
use econlab::monitor::expected_response;
use econlab::output::{OutputResult, OutputWriter};
use econlab::protocol::{Command, MonitorAction, MonitorReply, SubjectUpdate};
use econlab::state::AppState;
use econlab::types::Choice;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Output writer that records every flush instead of touching the disk.
#[derive(Default)]
struct StubWriter {
    flushes: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl OutputWriter for StubWriter {
    async fn flush(&self, filename: &str, contents: &str) -> OutputResult<String> {
        self.flushes
            .lock()
            .unwrap()
            .push((filename.to_string(), contents.to_string()));
        Ok(format!("/data/{}", filename))
    }
}

async fn authenticate(state: &Arc<AppState>) -> String {
    let outcome = handle_command(
        Command::MonitorRequest {
            monitor_id: "mon".to_string(),
        },
        state,
    )
    .await;
    match outcome {
        Outcome::Monitor(MonitorReply::Challenge(challenge)) => {
            expected_response(challenge.parse().expect("challenge is a float"))
        }
        _ => panic!("Expected a challenge"),
    }
}

async fn monitor_cmd(state: &Arc<AppState>, response: &str, action: MonitorAction) -> Outcome {
    handle_command(
        Command::MonitorRespond {
            monitor_id: "mon".to_string(),
            response: response.to_string(),
            action,
            sync: false,
        },
        state,
    )
    .await
}

async fn pend(
    state: &Arc<AppState>,
    identity: &str,
    real_id: Option<u32>,
) -> oneshot::Receiver<SubjectUpdate> {
    let outcome = handle_command(
        Command::Pend {
            identity: identity.to_string(),
            real_id,
        },
        state,
    )
    .await;
    match outcome {
        Outcome::ParkedSubject(rx) => rx,
        _ => panic!("Expected {} to be parked", identity),
    }
}

async fn submit(state: &Arc<AppState>, identity: &str, choice: Choice) {
    let outcome = handle_command(
        Command::Submit {
            identity: identity.to_string(),
            real_id: None,
            choice,
        },
        state,
    )
    .await;
    assert!(
        matches!(outcome, Outcome::Ack),
        "submission from {} was not acknowledged",
        identity
    );
}

/// End-to-end flow: monitor handshake, admission, a full iteration, an
/// end-test wind-down with output flush.
#[tokio::test]
async fn test_full_experiment_flow() {
    let writer = Arc::new(StubWriter::default());
    let config = LabConfig {
        number_of_iterations: 5,
        kill_timeout: None,
        ..LabConfig::default()
    };
    let state = Arc::new(AppState::with_writer(config, writer.clone()));

    // 1. Monitor authenticates and opens admission
    let response = authenticate(&state).await;
    let outcome = monitor_cmd(&state, &response, MonitorAction::StartAccepting).await;
    assert!(matches!(outcome, Outcome::Monitor(MonitorReply::Ok)));

    // 2. Two subjects connect and park
    let poll_a = pend(&state, "0.111", Some(1)).await;
    let poll_b = pend(&state, "0.222", Some(2)).await;

    // 3. Counts are publicly visible
    let outcome = handle_command(Command::ClientInfo, &state).await;
    match outcome {
        Outcome::Info(info) => {
            assert_eq!(info.number_of_subjects, 2);
            assert_eq!(info.number_of_groups, 1);
            assert_eq!(info.round, 0);
        }
        _ => panic!("Expected client info"),
    }

    // 4. Test starts; both parked polls receive begin
    let outcome = monitor_cmd(&state, &response, MonitorAction::StartTest).await;
    assert!(matches!(outcome, Outcome::Monitor(MonitorReply::Ok)));
    for poll in [poll_a, poll_b] {
        match poll.await.unwrap() {
            SubjectUpdate::Begin {
                in_count, subjects, ..
            } => {
                assert_eq!(in_count, 2);
                assert_eq!(subjects, 2);
            }
            other => panic!("Expected begin, got {:?}", other),
        }
    }

    // 5. First iteration: A stays stochastic, B takes the constant payoff
    let poll_a = pend(&state, "0.111", Some(1)).await;
    let poll_b = pend(&state, "0.222", Some(2)).await;
    submit(&state, "0.111", Choice::Random).await;
    submit(&state, "0.222", Choice::Constant).await;

    match poll_a.await.unwrap() {
        SubjectUpdate::RoundPassed {
            iteration,
            in_count,
            out,
            choice,
            ..
        } => {
            assert_eq!(iteration, 1);
            assert_eq!(in_count, 1);
            assert_eq!(out, 1);
            assert_eq!(choice, Choice::Random);
        }
        other => panic!("Expected round_passed, got {:?}", other),
    }
    match poll_b.await.unwrap() {
        SubjectUpdate::RoundPassed {
            choice, const_offer, ..
        } => {
            assert_eq!(choice, Choice::Constant);
            assert_eq!(const_offer, 80.0);
        }
        other => panic!("Expected round_passed, got {:?}", other),
    }

    // 6. Monitor asks to end; parked subjects are told, monitor waits
    let poll_a = pend(&state, "0.111", Some(1)).await;
    let poll_b = pend(&state, "0.222", Some(2)).await;
    let monitor_rx = match monitor_cmd(&state, &response, MonitorAction::EndTest).await {
        Outcome::ParkedMonitor(rx) => rx,
        _ => panic!("Expected the monitor to be parked"),
    };
    assert_eq!(poll_a.await.unwrap(), SubjectUpdate::End);
    assert_eq!(poll_b.await.unwrap(), SubjectUpdate::End);

    // 7. Subjects finish the in-flight iteration; the test finalizes
    let poll_a = pend(&state, "0.111", Some(1)).await;
    let poll_b = pend(&state, "0.222", Some(2)).await;
    submit(&state, "0.111", Choice::Random).await;
    submit(&state, "0.222", Choice::Random).await;

    assert_eq!(poll_a.await.unwrap(), SubjectUpdate::FinalizeEnd);
    assert_eq!(poll_b.await.unwrap(), SubjectUpdate::FinalizeEnd);

    // 8. The monitor gets the flushed output's location, exactly once
    let location = match monitor_rx.await.unwrap() {
        MonitorReply::OutputLocation(location) => location,
        other => panic!("Expected an output location, got {:?}", other),
    };
    assert!(location.starts_with("/data/output"));
    assert!(location.ends_with(".csv"));

    let flushes = writer.flushes.lock().unwrap();
    assert_eq!(flushes.len(), 1);
    let (filename, contents) = &flushes[0];
    assert!(!filename.contains(".tmp."));
    assert!(contents.starts_with("Round 1\nGlobalID,PlayerID,GroupID,"));
    // two subjects, two completed iterations
    assert_eq!(contents.lines().count(), 2 + 4);
}

/// Ending a test with nobody admitted answers the monitor immediately.
#[tokio::test]
async fn test_end_test_without_subjects_is_immediate() {
    let state = Arc::new(AppState::new(LabConfig {
        kill_timeout: None,
        ..LabConfig::default()
    }));
    let response = authenticate(&state).await;

    match monitor_cmd(&state, &response, MonitorAction::EndTest).await {
        Outcome::Monitor(reply) => assert_eq!(reply, MonitorReply::Terminal),
        _ => panic!("Expected an immediate terminal reply"),
    }
}

/// A round rollover hands out reshuffled identities and a temp snapshot.
#[tokio::test]
async fn test_round_rollover_reassigns_identities() {
    let writer = Arc::new(StubWriter::default());
    let config = LabConfig {
        number_of_iterations: 0, // one iteration per round
        kill_timeout: None,
        ..LabConfig::default()
    };
    let state = Arc::new(AppState::with_writer(config, writer.clone()));

    let response = authenticate(&state).await;
    monitor_cmd(&state, &response, MonitorAction::StartAccepting).await;
    let poll_a = pend(&state, "0.111", Some(1)).await;
    let poll_b = pend(&state, "0.222", Some(2)).await;
    monitor_cmd(&state, &response, MonitorAction::StartTest).await;
    drop((poll_a, poll_b));

    let poll_a = pend(&state, "0.111", Some(1)).await;
    let poll_b = pend(&state, "0.222", Some(2)).await;
    submit(&state, "0.111", Choice::Random).await;
    submit(&state, "0.222", Choice::Random).await;

    let mut new_ids = Vec::new();
    for poll in [poll_a, poll_b] {
        match poll.await.unwrap() {
            SubjectUpdate::Restart {
                new_realid,
                round,
                value,
                ..
            } => {
                assert_eq!(round, 2);
                assert_eq!(value, 0.0); // configured initial value
                new_ids.push(new_realid);
            }
            other => panic!("Expected restart, got {:?}", other),
        }
    }
    new_ids.sort_unstable();
    assert_eq!(new_ids, vec![1, 2]);

    // the rollover snapshot was tagged temporary
    let flushes = writer.flushes.lock().unwrap();
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].0.contains(".tmp."));
}

/// Kill wipes everything and forces connected subjects to reload.
#[tokio::test]
async fn test_kill_everything_broadcasts_kill() {
    let state = Arc::new(AppState::new(LabConfig {
        kill_timeout: None,
        ..LabConfig::default()
    }));
    let response = authenticate(&state).await;
    monitor_cmd(&state, &response, MonitorAction::StartAccepting).await;
    let poll = pend(&state, "0.111", Some(1)).await;

    match monitor_cmd(&state, &response, MonitorAction::KillEverything).await {
        Outcome::Monitor(MonitorReply::Ok) => {}
        _ => panic!("Expected kill to be acknowledged"),
    }
    assert_eq!(poll.await.unwrap(), SubjectUpdate::Kill);

    // the kill cleared the monitor's challenge too; the old response is dead
    match monitor_cmd(&state, &response, MonitorAction::CheckStatus).await {
        Outcome::Monitor(reply) => assert_eq!(reply, MonitorReply::Unauthenticated),
        _ => panic!("Expected unauthenticated"),
    }

    // but admission stayed open: a new subject can still pend
    let _poll = pend(&state, "0.333", Some(1)).await;
}
