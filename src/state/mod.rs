mod export;
mod roster;
mod round;
mod submit;

pub use export::{CsvRow, OutputBuffer, CSV_HEADER};
pub use round::{AdvanceEffect, EndTestOutcome};
pub use submit::SubmitOutcome;

use crate::config::LabConfig;
use crate::monitor::MonitorAuthority;
use crate::output::{FsOutputWriter, OutputWriter};
use crate::payoff::PayoffGenerator;
use crate::protocol::ClientInfoReply;
use crate::registry::ConnectionRegistry;
use crate::stats;
use crate::types::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-round per-group working state. The in/out vectors are lock-step
/// pairs: `in_values[i]` is the current value of the subject `id_in[i]`.
#[derive(Debug, Default, Clone)]
pub struct GroupState {
    pub id_in: Vec<ModId>,
    pub id_out: Vec<ModId>,
    pub in_values: Vec<f64>,
    pub out_values: Vec<f64>,
    /// Each subject's value under its current choice
    pub current: HashMap<ModId, f64>,
    /// Candidate values for the next decision, kept fresh for both streams
    pub rand_offer: HashMap<ModId, f64>,
    pub const_offer: HashMap<ModId, f64>,
}

impl GroupState {
    pub fn subjects(&self) -> usize {
        self.id_in.len() + self.id_out.len()
    }
}

/// One subject's record for one period.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubjectCell {
    pub choice: Option<Choice>,
    pub value: f64,
    pub accumulation: f64,
    /// Offers generated at this period's close, for the next decision
    pub rand_offer: f64,
    pub const_offer: f64,
}

/// Aggregates across one group's subjects for one period.
#[derive(Debug, Default, Clone)]
pub struct IterationStats {
    pub values: Vec<f64>,
    pub accumulations: Vec<f64>,
    pub average_new_offer: f64,
    pub average_accumulation: f64,
}

/// The single in-process authority over all experiment state. Constructed
/// once at startup and only ever mutated under the [`AppState`] lock, so
/// every command runs to completion before the next touches anything.
pub struct ExperimentCore {
    pub config: Arc<LabConfig>,
    pub registry: ConnectionRegistry,
    pub payoffs: PayoffGenerator,
    pub monitors: MonitorAuthority,
    pub output: OutputBuffer,

    pub groups: HashMap<GroupKey, GroupState>,
    pub cells: HashMap<CellKey, SubjectCell>,
    pub iter_stats: HashMap<IterKey, IterationStats>,
    /// Idempotence record: has this identity submitted this iteration?
    pub(crate) submissions: HashSet<(RoundNo, ConnectionId, IterNo)>,

    /// 1-based; 0 while no round has ever started
    pub current_round: RoundNo,
    /// Completed iterations in the current round
    pub current_iteration: IterNo,
    pub(crate) num_submitted: u32,
    pub number_of_subjects: u32,
    pub number_of_groups: u32,

    pub accepting_subjects: bool,
    pub testing_in_progress: bool,
    pub practice_mode: bool,

    /// Highest stochastic value any subject of a group has seen across the
    /// whole test; only ever grows, reset solely by a kill
    pub max_y: HashMap<GroupNo, f64>,
    pub(crate) shuffle_rng: StdRng,
}

impl ExperimentCore {
    pub fn new(config: Arc<LabConfig>) -> Self {
        Self {
            payoffs: PayoffGenerator::new(&config),
            monitors: MonitorAuthority::new(),
            registry: ConnectionRegistry::new(),
            output: OutputBuffer::default(),
            groups: HashMap::new(),
            cells: HashMap::new(),
            iter_stats: HashMap::new(),
            submissions: HashSet::new(),
            current_round: 0,
            current_iteration: 0,
            num_submitted: 0,
            number_of_subjects: 0,
            number_of_groups: 0,
            accepting_subjects: false,
            testing_in_progress: false,
            practice_mode: false,
            max_y: HashMap::new(),
            shuffle_rng: StdRng::from_os_rng(),
            config,
        }
    }

    pub fn group_mut(&mut self, key: GroupKey) -> &mut GroupState {
        self.groups.entry(key).or_default()
    }

    pub fn cell(&self, key: CellKey) -> SubjectCell {
        self.cells.get(&key).copied().unwrap_or_default()
    }

    pub fn cell_mut(&mut self, key: CellKey) -> &mut SubjectCell {
        self.cells.entry(key).or_default()
    }

    /// (group, modulated id) for a valid real id; `None` for the 0
    /// placeholder a client uses before it learns its id.
    pub fn subject_pos(&self, real_id: RealId) -> Option<(GroupNo, ModId)> {
        if real_id == 0 {
            return None;
        }
        let size = self.config.people_per_group;
        Some((group_no(real_id, size), modulated_id(real_id, size)))
    }

    /// Bump a group's all-time maximum; it never goes back down.
    pub fn raise_max_y(&mut self, group: GroupNo, candidate: f64) -> f64 {
        let entry = self.max_y.entry(group).or_insert(candidate);
        if candidate > *entry {
            *entry = candidate;
        }
        *entry
    }

    /// Wipe every piece of state except the admission flag. Subjects that
    /// were parked have already been answered with a kill message.
    pub fn kill_everything(&mut self) {
        self.registry
            .broadcast_all(|_, _| crate::protocol::SubjectUpdate::Kill);
        self.registry.clear();
        self.monitors.clear();
        self.output.clear();
        self.groups.clear();
        self.cells.clear();
        self.iter_stats.clear();
        self.submissions.clear();
        self.current_round = 0;
        self.current_iteration = 0;
        self.num_submitted = 0;
        self.number_of_subjects = 0;
        self.number_of_groups = 0;
        self.testing_in_progress = false;
        self.practice_mode = false;
        self.max_y.clear();
        self.payoffs.round_changed();
        tracing::info!("Experiment state killed; accepting_subjects retained");
    }

    /// Public counts for the `client_info` command.
    pub fn client_info(&self) -> ClientInfoReply {
        let live_groups = (self.registry.parked_count() as u32).div_ceil(self.config.people_per_group);
        ClientInfoReply {
            number_of_groups: if live_groups > 0 {
                live_groups
            } else {
                self.number_of_groups
            },
            number_of_subjects: self.registry.admitted_count(),
            iteration: self.current_iteration + 1,
            round: self.current_round,
        }
    }

    /// Space-joined status tokens for the monitor console.
    pub fn status_string(&self) -> String {
        let mut tokens = Vec::new();
        if self.accepting_subjects {
            tokens.push("accepting");
        }
        if self.testing_in_progress {
            tokens.push("testing");
        }
        if self.practice_mode {
            tokens.push("practicing");
        }
        tokens.join(" ")
    }

    /// Chart refresh snapshot for one subject: previous period's value and
    /// accumulation plus the live group aggregates.
    pub fn graph_info(
        &mut self,
        identity: &ConnectionId,
        real_id: Option<RealId>,
    ) -> Option<crate::protocol::SubjectUpdate> {
        if !self.registry.is_admitted(identity) {
            return None;
        }
        let real = real_id
            .filter(|&r| r > 0)
            .or_else(|| self.registry.real_id(identity))?;
        let (group, subject) = self.subject_pos(real)?;
        let round = self.current_round;
        let completed = self.current_iteration;

        let gkey = GroupKey { round, group };
        let state = self.groups.get(&gkey).cloned().unwrap_or_default();
        let prev = self.cell(CellKey {
            round,
            group,
            iteration: completed,
            subject,
        });
        let live = self
            .iter_stats
            .get(&IterKey {
                round,
                group,
                iteration: completed + 1,
            })
            .map(|s| s.average_accumulation)
            .unwrap_or(0.0);

        let max = self.raise_max_y(group, stats::max(&state.in_values));
        let choice = if state.id_in.contains(&subject) {
            Choice::Random
        } else {
            Choice::Constant
        };

        Some(crate::protocol::SubjectUpdate::GraphInfo {
            value: prev.value,
            average_value: stats::mean(&state.in_values),
            accumulation: prev.accumulation,
            average_accumulation: live,
            iteration: completed + 1,
            in_count: state.id_in.len(),
            out: state.id_out.len(),
            subjects: state.subjects(),
            choice,
            max,
            const_offer: state.const_offer.get(&subject).copied().unwrap_or(0.0),
            rand_offer: state.rand_offer.get(&subject).copied().unwrap_or(0.0),
        })
    }
}

/// Shared handle over the experiment core plus the output collaborator.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Mutex<ExperimentCore>>,
    pub config: Arc<LabConfig>,
    pub writer: Arc<dyn OutputWriter>,
}

impl AppState {
    pub fn new(config: LabConfig) -> Self {
        Self::with_writer(config, Arc::new(FsOutputWriter::default()))
    }

    pub fn with_writer(config: LabConfig, writer: Arc<dyn OutputWriter>) -> Self {
        let config = Arc::new(config);
        Self {
            core: Arc::new(Mutex::new(ExperimentCore::new(config.clone()))),
            config,
            writer,
        }
    }
}
