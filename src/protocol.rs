//! Wire protocol between the core and its transport adapter.
//!
//! The transport parses each request into a [`Command`]; the core answers
//! with either a JSON [`SubjectUpdate`] / [`ClientInfoReply`] or a short
//! plain-text [`MonitorReply`] token. Long-poll commands answer later,
//! through a parked oneshot channel.

use crate::types::*;
use serde::{Deserialize, Serialize};

/// A parsed inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Long-poll: park until the next broadcast
    Pend {
        identity: ConnectionId,
        real_id: Option<RealId>,
    },
    /// A decision for the current iteration
    Submit {
        identity: ConnectionId,
        real_id: Option<RealId>,
        choice: Choice,
    },
    /// Public test-shape counts
    ClientInfo,
    /// Liveness ping
    Alive { identity: ConnectionId },
    /// Explicit departure
    Leave { identity: ConnectionId },
    /// Chart refresh data for one subject
    GraphInfo {
        identity: ConnectionId,
        real_id: Option<RealId>,
    },
    /// Monitor asks for a fresh authentication challenge
    MonitorRequest { monitor_id: MonitorId },
    /// Monitor answers the challenge and names a privileged action
    MonitorRespond {
        monitor_id: MonitorId,
        response: String,
        action: MonitorAction,
        /// Ask the server to wait until the subject roster has settled
        sync: bool,
    },
}

/// Privileged actions a verified monitor can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Auth probe; no side effects
    Test,
    Leave,
    KillEverything,
    CheckStatus,
    StartPractice,
    EndPractice,
    StartAccepting,
    StopAccepting,
    StartTest,
    EndTest,
    /// Authenticated but unrecognized; acknowledged without effect
    Unknown,
}

impl MonitorAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "test" => MonitorAction::Test,
            "leave" => MonitorAction::Leave,
            "killEverything" => MonitorAction::KillEverything,
            "checkStatus" => MonitorAction::CheckStatus,
            "startPractice" => MonitorAction::StartPractice,
            "endPractice" => MonitorAction::EndPractice,
            "startAccepting" => MonitorAction::StartAccepting,
            "stopAccepting" => MonitorAction::StopAccepting,
            "startTest" => MonitorAction::StartTest,
            "endTest" => MonitorAction::EndTest,
            _ => MonitorAction::Unknown,
        }
    }
}

/// Message delivered to a subject, either directly or through a drained
/// long-poll. The `message` tag is what the browser switches on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum SubjectUpdate {
    /// The test has started; first-period data
    Begin {
        value: f64,
        average_value: f64,
        iteration: IterNo,
        #[serde(rename = "in")]
        in_count: usize,
        out: usize,
        subjects: usize,
        accumulation: f64,
        average_accumulation: f64,
        #[serde(rename = "const")]
        const_offer: f64,
        #[serde(rename = "rand")]
        rand_offer: f64,
        x_visible_to_out_subjects: bool,
    },
    /// An iteration completed; data for the next one
    RoundPassed {
        value: f64,
        average_value: f64,
        accumulation: f64,
        average_accumulation: f64,
        iteration: IterNo,
        #[serde(rename = "in")]
        in_count: usize,
        out: usize,
        subjects: usize,
        max: f64,
        choice: Choice,
        #[serde(rename = "const")]
        const_offer: f64,
        #[serde(rename = "rand")]
        rand_offer: f64,
    },
    /// A round rolled over; the subject gets a new identity
    Restart {
        value: f64,
        average_value: f64,
        new_realid: RealId,
        iteration: IterNo,
        round: RoundNo,
        #[serde(rename = "in")]
        in_count: usize,
        out: usize,
        subjects: usize,
        accumulation: f64,
        average_accumulation: f64,
        max: f64,
        #[serde(rename = "const")]
        const_offer: f64,
        #[serde(rename = "rand")]
        rand_offer: f64,
    },
    /// Chart refresh for one subject (answered immediately, not parked)
    GraphInfo {
        value: f64,
        average_value: f64,
        accumulation: f64,
        average_accumulation: f64,
        iteration: IterNo,
        #[serde(rename = "in")]
        in_count: usize,
        out: usize,
        subjects: usize,
        choice: Choice,
        max: f64,
        #[serde(rename = "const")]
        const_offer: f64,
        #[serde(rename = "rand")]
        rand_offer: f64,
    },
    /// Terminal: the monitor ended the test and the last iteration is done
    FinalizeEnd,
    /// The monitor asked for the test to end
    End,
    /// Everything was reset; discard local state and reload
    Kill,
    /// Admission is closed
    ClientsNotAccepted,
    /// A newer long-poll replaced this one
    Superseded,
}

/// Public counts payload for the `client_info` command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfoReply {
    pub number_of_groups: u32,
    pub number_of_subjects: usize,
    pub iteration: IterNo,
    pub round: RoundNo,
}

/// Short text replies to the monitor console.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorReply {
    /// Generic acknowledgment: `+`
    Ok,
    /// Authentication failed or nothing to do: `-`
    Unauthenticated,
    /// Terminal end-of-test marker when nobody is left: `#`
    Terminal,
    /// Auth probe succeeded
    Success,
    /// Space-joined status tokens (`accepting testing practicing`)
    Status(String),
    /// Fresh authentication challenge
    Challenge(String),
    /// Where the flushed results were written
    OutputLocation(String),
}

impl MonitorReply {
    /// Wire encoding, matching what the monitor console expects.
    pub fn as_text(&self) -> String {
        match self {
            MonitorReply::Ok => "+".to_string(),
            MonitorReply::Unauthenticated => "-".to_string(),
            MonitorReply::Terminal => "#".to_string(),
            MonitorReply::Success => "success".to_string(),
            MonitorReply::Status(s) => s.clone(),
            MonitorReply::Challenge(c) => c.clone(),
            MonitorReply::OutputLocation(path) => path.clone(),
        }
    }
}
