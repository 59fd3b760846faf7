//! Decision submission: in/out membership moves, accumulation bookkeeping,
//! and the completion check that drives the iteration state machine.

use super::{AppState, ExperimentCore};
use crate::types::*;

/// What became of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Identity is not part of the cohort, or no round is active
    NotFound,
    /// Already recorded for this iteration; acknowledged, nothing changed
    Duplicate,
    /// Recorded; `cohort_complete` means this was the last expected
    /// submission and the iteration must advance
    Accepted { cohort_complete: bool },
}

impl ExperimentCore {
    /// Record one subject's decision for the in-flight iteration.
    pub fn apply_submission(
        &mut self,
        identity: &ConnectionId,
        real_id: Option<RealId>,
        choice: Choice,
    ) -> SubmitOutcome {
        if !self.registry.is_admitted(identity) || !self.testing_in_progress {
            return SubmitOutcome::NotFound;
        }
        let real = match real_id
            .filter(|&r| r > 0)
            .or_else(|| self.registry.real_id(identity).filter(|&r| r > 0))
        {
            Some(r) => r,
            None => return SubmitOutcome::NotFound,
        };
        let (group, subject) = match self.subject_pos(real) {
            Some(pos) => pos,
            None => return SubmitOutcome::NotFound,
        };

        let round = self.current_round;
        let iteration = self.current_iteration + 1;
        let record = (round, identity.clone(), iteration);
        if self.submissions.contains(&record) {
            return SubmitOutcome::Duplicate;
        }
        self.submissions.insert(record);

        let gkey = GroupKey { round, group };
        let state = self.group_mut(gkey);

        // Moving between sets carries the matching value-array entry along,
        // so each set's array length always equals its cardinality.
        match choice {
            Choice::Random => {
                if !state.id_in.contains(&subject) {
                    let offer = state.rand_offer.get(&subject).copied().unwrap_or(0.0);
                    state.id_in.push(subject);
                    state.in_values.push(offer);
                    state.current.insert(subject, offer);
                }
                if let Some(pos) = state.id_out.iter().position(|&m| m == subject) {
                    state.id_out.remove(pos);
                    state.out_values.remove(pos);
                }
            }
            Choice::Constant => {
                if !state.id_out.contains(&subject) {
                    let offer = state.const_offer.get(&subject).copied().unwrap_or(0.0);
                    state.id_out.push(subject);
                    state.out_values.push(offer);
                    state.current.insert(subject, offer);
                }
                if let Some(pos) = state.id_in.iter().position(|&m| m == subject) {
                    state.id_in.remove(pos);
                    state.in_values.remove(pos);
                }
            }
        }
        let value = state.current.get(&subject).copied().unwrap_or(0.0);

        let previous = self.cell(CellKey {
            round,
            group,
            iteration: iteration - 1,
            subject,
        });
        let accumulation = previous.accumulation + value;

        let cell = self.cell_mut(CellKey {
            round,
            group,
            iteration,
            subject,
        });
        cell.choice = Some(choice);
        cell.value = value;
        cell.accumulation = accumulation;

        let stats = self
            .iter_stats
            .entry(IterKey {
                round,
                group,
                iteration,
            })
            .or_default();
        stats.values.push(value);
        stats.accumulations.push(accumulation);

        self.num_submitted += 1;
        let cohort_complete = self.num_submitted >= self.number_of_subjects;
        if cohort_complete {
            self.num_submitted = 0;
        }
        SubmitOutcome::Accepted { cohort_complete }
    }
}

impl AppState {
    /// Full submission path: record the decision and, when this was the
    /// cohort's last, run the iteration/round transition (which may flush
    /// output to the writer collaborator).
    pub async fn submit(
        &self,
        identity: &ConnectionId,
        real_id: Option<RealId>,
        choice: Choice,
    ) -> SubmitOutcome {
        let mut core = self.core.lock().await;
        let outcome = core.apply_submission(identity, real_id, choice);
        if let SubmitOutcome::Accepted {
            cohort_complete: true,
        } = outcome
        {
            let effect = core.advance_iteration();
            self.perform_flush(&mut core, effect).await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabConfig;
    use crate::payoff::PayoffGenerator;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    /// Two admitted subjects, round started, everyone in-set.
    fn active_core() -> ExperimentCore {
        let config = Arc::new(LabConfig::default());
        let mut core = ExperimentCore::new(config.clone());
        core.payoffs = PayoffGenerator::with_rng(&config, StdRng::seed_from_u64(42));
        core.accepting_subjects = true;
        core.pend(&"a".to_string(), Some(1)).unwrap();
        core.pend(&"b".to_string(), Some(2)).unwrap();
        core.start_test();
        core
    }

    #[test]
    fn test_submit_without_round_is_not_found() {
        let mut core = ExperimentCore::new(Arc::new(LabConfig::default()));
        core.accepting_subjects = true;
        core.pend(&"a".to_string(), Some(1)).unwrap();
        assert_eq!(
            core.apply_submission(&"a".to_string(), Some(1), Choice::Random),
            SubmitOutcome::NotFound
        );
    }

    #[test]
    fn test_submit_from_stranger_is_not_found() {
        let mut core = active_core();
        assert_eq!(
            core.apply_submission(&"nobody".to_string(), Some(1), Choice::Random),
            SubmitOutcome::NotFound
        );
    }

    #[test]
    fn test_duplicate_submission_is_acknowledged_once() {
        let mut core = active_core();
        let first = core.apply_submission(&"a".to_string(), Some(1), Choice::Random);
        assert_eq!(
            first,
            SubmitOutcome::Accepted {
                cohort_complete: false
            }
        );
        let again = core.apply_submission(&"a".to_string(), Some(1), Choice::Random);
        assert_eq!(again, SubmitOutcome::Duplicate);

        // the duplicate neither double-counts the submitter...
        let stats = &core.iter_stats[&IterKey {
            round: 1,
            group: 1,
            iteration: 1,
        }];
        assert_eq!(stats.values.len(), 1);
        // ...nor completes the cohort
        assert_eq!(core.num_submitted, 1);
    }

    #[test]
    fn test_choice_moves_between_sets_in_lock_step() {
        let mut core = active_core();
        let gkey = GroupKey { round: 1, group: 1 };
        // both subjects start in-set with their stochastic offers
        assert_eq!(core.groups[&gkey].id_in, vec![1, 2]);
        assert_eq!(core.groups[&gkey].in_values.len(), 2);

        core.apply_submission(&"a".to_string(), Some(1), Choice::Constant);
        let state = &core.groups[&gkey];
        assert_eq!(state.id_in, vec![2]);
        assert_eq!(state.in_values.len(), 1);
        assert_eq!(state.id_out, vec![1]);
        assert_eq!(state.out_values.len(), 1);
        // the subject's value became its cached constant candidate
        assert_eq!(state.current[&1], state.const_offer[&1]);
        assert_eq!(state.out_values[0], state.const_offer[&1]);
    }

    #[test]
    fn test_in_and_out_sets_always_partition_the_group() {
        let mut core = active_core();
        let gkey = GroupKey { round: 1, group: 1 };

        core.apply_submission(&"a".to_string(), Some(1), Choice::Constant);
        core.apply_submission(&"b".to_string(), Some(2), Choice::Random);

        let state = &core.groups[&gkey];
        let mut all: Vec<ModId> = state
            .id_in
            .iter()
            .chain(state.id_out.iter())
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2]);
        assert!(state.id_in.iter().all(|m| !state.id_out.contains(m)));
        assert_eq!(state.in_values.len(), state.id_in.len());
        assert_eq!(state.out_values.len(), state.id_out.len());
    }

    #[test]
    fn test_accumulation_recurrence() {
        let mut core = active_core();
        let key = CellKey {
            round: 1,
            group: 1,
            iteration: 1,
            subject: 1,
        };
        core.apply_submission(&"a".to_string(), Some(1), Choice::Random);
        let first = core.cell(key);
        assert_eq!(first.accumulation, first.value);

        core.apply_submission(&"b".to_string(), Some(2), Choice::Random);
        // cohort completed; advance regenerates candidates for iteration 2
        let _ = core.advance_iteration();
        core.apply_submission(&"a".to_string(), Some(1), Choice::Random);
        let second = core.cell(CellKey {
            iteration: 2,
            ..key
        });
        assert_eq!(second.accumulation, first.accumulation + second.value);
    }

    #[test]
    fn test_last_submitter_completes_cohort() {
        let mut core = active_core();
        assert_eq!(
            core.apply_submission(&"a".to_string(), Some(1), Choice::Random),
            SubmitOutcome::Accepted {
                cohort_complete: false
            }
        );
        assert_eq!(
            core.apply_submission(&"b".to_string(), Some(2), Choice::Random),
            SubmitOutcome::Accepted {
                cohort_complete: true
            }
        );
        assert_eq!(core.num_submitted, 0);
    }
}
