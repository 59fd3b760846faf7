use serde::{Deserialize, Serialize};

/// Opaque per-tab connection id, chosen by the client at page load
pub type ConnectionId = String;
/// Monitor console identity (same namespace as connection ids)
pub type MonitorId = String;

/// Round-scoped subject identity, 1..=N, reassigned every round
pub type RealId = u32;
/// Position of a subject inside its group, 1..=group_size
pub type ModId = u32;
/// Group index, 1..=number_of_groups
pub type GroupNo = u32;
/// 1-based round counter (0 = no round has started)
pub type RoundNo = u32;
/// 1-based iteration counter within a round
pub type IterNo = u32;

/// The two payoff streams a subject can pick from each period
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    /// Follow the time-varying value (the latent process plus noise)
    Random,
    /// Take the fixed payoff
    Constant,
}

impl Choice {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "random" => Some(Choice::Random),
            "constant" => Some(Choice::Constant),
            _ => None,
        }
    }

    /// CSV encoding: 0 for the time-varying stream, 1 for the constant one
    pub fn csv_code(self) -> u8 {
        match self {
            Choice::Random => 0,
            Choice::Constant => 1,
        }
    }
}

/// Position of a subject within its group: `((real_id - 1) % group_size) + 1`
pub fn modulated_id(real_id: RealId, group_size: u32) -> ModId {
    (real_id - 1) % group_size + 1
}

/// Group a real id belongs to: `(real_id - 1) / group_size + 1`
pub fn group_no(real_id: RealId, group_size: u32) -> GroupNo {
    (real_id - 1) / group_size + 1
}

/// Composite key for per-round per-group state tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub round: RoundNo,
    pub group: GroupNo,
}

/// Composite key for per-iteration aggregate tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IterKey {
    pub round: RoundNo,
    pub group: GroupNo,
    pub iteration: IterNo,
}

/// Composite key for a single subject's record in a single period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub round: RoundNo,
    pub group: GroupNo,
    pub iteration: IterNo,
    pub subject: ModId,
}

impl CellKey {
    pub fn iter_key(&self) -> IterKey {
        IterKey {
            round: self.round,
            group: self.group,
            iteration: self.iteration,
        }
    }
}
