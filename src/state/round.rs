//! The round/iteration state machine: starting a test, advancing an
//! iteration when the cohort has fully submitted, rolling a round over with
//! reshuffled identities, and winding the test down for the monitor.

use super::{AppState, CsvRow, ExperimentCore, GroupState};
use crate::protocol::{MonitorReply, SubjectUpdate};
use crate::stats;
use crate::types::*;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Side effect an iteration advance asks the caller to carry out. Flushing
/// goes through the async output-writer collaborator, which the sync core
/// cannot call itself.
#[derive(Debug)]
pub enum AdvanceEffect {
    /// Iteration advanced; broadcasts already went out
    None,
    /// Round rolled over; persist a temporary snapshot
    TempFlush { filename: String, contents: String },
    /// Test finished; persist the final output and hand the location to the
    /// waiting monitor
    FinalFlush { filename: String, contents: String },
}

/// How an end-test request was answered.
pub enum EndTestOutcome {
    /// Nobody is admitted; the monitor gets the terminal marker at once
    Immediate(MonitorReply),
    /// Subjects are still in; the monitor waits for the in-flight iteration
    Parked(oneshot::Receiver<MonitorReply>),
}

impl ExperimentCore {
    /// Begin a round over the currently admitted roster: fix the cohort,
    /// partition it into groups, seed first-period candidate values with
    /// everyone in-set.
    pub(crate) fn start_round_state(&mut self) {
        self.current_iteration = 0;
        self.current_round += 1;
        self.testing_in_progress = true;
        self.num_submitted = 0;
        self.number_of_subjects = self.registry.admitted_count() as u32;
        let size = self.config.people_per_group;
        self.number_of_groups = self.number_of_subjects.div_ceil(size);
        let round = self.current_round;

        for group in 1..=self.number_of_groups {
            let members = size.min(self.number_of_subjects - (group - 1) * size);
            let mut state = GroupState::default();
            for subject in 1..=members {
                let value = self.payoffs.random_value(group, 0);
                let alt = self.payoffs.constant_value();
                state.id_in.push(subject);
                state.in_values.push(value);
                state.current.insert(subject, value);
                state.rand_offer.insert(subject, value);
                state.const_offer.insert(subject, alt);
                let cell = self.cell_mut(CellKey {
                    round,
                    group,
                    iteration: 1,
                    subject,
                });
                cell.rand_offer = value;
                cell.const_offer = alt;
            }
            self.groups.insert(GroupKey { round, group }, state);
        }
        tracing::info!(
            "Round {} started: {} subjects in {} group(s)",
            round,
            self.number_of_subjects,
            self.number_of_groups
        );
    }

    /// Monitor's start-test: capture the roster as the round's cohort and
    /// tell every parked subject to begin.
    pub fn start_test(&mut self) {
        self.start_round_state();
        let round = self.current_round;
        let x_visible = self.config.x_visible_to_out_subjects;

        let parked = self.registry.drain_parked();
        for client in parked {
            let (group, subject) = match self.subject_pos(client.real_id) {
                Some(pos) => pos,
                None => {
                    // parked before learning an id; just make it re-poll
                    client.respond(SubjectUpdate::Superseded);
                    continue;
                }
            };
            let state = self
                .groups
                .get(&GroupKey { round, group })
                .cloned()
                .unwrap_or_default();
            let value = state.current.get(&subject).copied().unwrap_or(0.0);
            client.respond(SubjectUpdate::Begin {
                value,
                average_value: stats::mean(&state.in_values),
                iteration: 0,
                in_count: state.id_in.len(),
                out: state.id_out.len(),
                subjects: state.subjects(),
                accumulation: value,
                average_accumulation: 0.0,
                const_offer: state.const_offer.get(&subject).copied().unwrap_or(0.0),
                rand_offer: state.rand_offer.get(&subject).copied().unwrap_or(0.0),
                x_visible_to_out_subjects: x_visible,
            });
        }
    }

    /// Run after the cohort's last submission of an iteration.
    pub fn advance_iteration(&mut self) -> AdvanceEffect {
        self.current_iteration += 1;
        let completed = self.current_iteration;

        if completed >= self.config.iteration_amount() && !self.registry.monitor_waiting() {
            return self.roll_round();
        }

        let old_averages = self.regenerate_offers(completed);
        if self.registry.monitor_waiting() {
            self.finalize_end(completed, &old_averages)
        } else {
            self.broadcast_round_passed(completed);
            AdvanceEffect::None
        }
    }

    /// Fresh candidate values for every subject going into the next period.
    /// In-set subjects get a stochastic draw as their value and a constant
    /// draw as the alternative; out-set subjects the reverse, so both
    /// candidates stay current whichever way a subject last chose.
    fn regenerate_offers(&mut self, completed: IterNo) -> HashMap<GroupNo, f64> {
        let round = self.current_round;
        let period = completed.saturating_sub(1) as usize;
        let mut old_averages = HashMap::new();

        for group in 1..=self.number_of_groups {
            let gkey = GroupKey { round, group };
            let (ins, outs) = {
                let state = self.group_mut(gkey);
                old_averages.insert(group, stats::mean(&state.in_values));
                state.in_values.clear();
                state.out_values.clear();
                (state.id_in.clone(), state.id_out.clone())
            };

            for subject in ins {
                let value = self.payoffs.random_value(group, period);
                let alt = self.payoffs.constant_value();
                self.install_offers(gkey, completed, subject, value, alt, true);
            }
            for subject in outs {
                let value = self.payoffs.constant_value();
                let alt = self.payoffs.random_value(group, period);
                self.install_offers(gkey, completed, subject, alt, value, false);
            }

            let ikey = IterKey {
                round,
                group,
                iteration: completed,
            };
            let in_values = self
                .groups
                .get(&gkey)
                .map(|s| s.in_values.clone())
                .unwrap_or_default();
            let accumulations = self
                .iter_stats
                .get(&ikey)
                .map(|s| s.accumulations.clone())
                .unwrap_or_default();
            let entry = self.iter_stats.entry(ikey).or_default();
            entry.average_new_offer = stats::mean(&in_values);
            entry.average_accumulation = stats::mean(&accumulations);
        }
        old_averages
    }

    fn install_offers(
        &mut self,
        gkey: GroupKey,
        iteration: IterNo,
        subject: ModId,
        rand_value: f64,
        const_value: f64,
        in_set: bool,
    ) {
        let state = self.group_mut(gkey);
        state.rand_offer.insert(subject, rand_value);
        state.const_offer.insert(subject, const_value);
        if in_set {
            state.in_values.push(rand_value);
            state.current.insert(subject, rand_value);
        } else {
            state.out_values.push(const_value);
            state.current.insert(subject, const_value);
        }
        let cell = self.cell_mut(CellKey {
            round: gkey.round,
            group: gkey.group,
            iteration,
            subject,
        });
        cell.rand_offer = rand_value;
        cell.const_offer = const_value;
    }

    /// Normal iteration boundary: record CSV rows, refresh aggregates and
    /// answer every parked subject with its next-period data.
    fn broadcast_round_passed(&mut self, completed: IterNo) {
        let round = self.current_round;
        let period = completed.saturating_sub(1) as usize;
        let practice = self.practice_mode as u8;

        let mut averages = HashMap::new();
        let mut thetas = HashMap::new();
        for group in 1..=self.number_of_groups {
            let in_values = self
                .groups
                .get(&GroupKey { round, group })
                .map(|s| s.in_values.clone())
                .unwrap_or_default();
            averages.insert(group, stats::mean(&in_values));
            self.raise_max_y(group, stats::max(&in_values));
            thetas.insert(group, self.payoffs.theta(period, group));
        }

        let parked = self.registry.drain_parked();
        for client in parked {
            let (group, subject) = match self.subject_pos(client.real_id) {
                Some(pos) => pos,
                None => {
                    client.respond(SubjectUpdate::Superseded);
                    continue;
                }
            };
            let gkey = GroupKey { round, group };
            let state = self.groups.get(&gkey).cloned().unwrap_or_default();
            let cell = self.cell(CellKey {
                round,
                group,
                iteration: completed,
                subject,
            });
            let iter_stats = self
                .iter_stats
                .get(&IterKey {
                    round,
                    group,
                    iteration: completed,
                })
                .cloned()
                .unwrap_or_default();
            let value = state.current.get(&subject).copied().unwrap_or(0.0);

            self.output.push(CsvRow {
                global_id: self.registry.global_id(&client.id).unwrap_or(client.real_id),
                player_id: subject,
                group,
                choice: cell.choice.map(Choice::csv_code).unwrap_or(1),
                payoff: value,
                period: completed,
                round,
                theta: thetas.get(&group).copied().unwrap_or(0.0),
                x: iter_stats.average_new_offer,
                practice,
                rand_offer: cell.rand_offer,
                const_offer: cell.const_offer,
            });

            client.respond(SubjectUpdate::RoundPassed {
                value,
                average_value: averages.get(&group).copied().unwrap_or(0.0),
                accumulation: cell.accumulation,
                average_accumulation: iter_stats.average_accumulation,
                iteration: completed,
                in_count: state.id_in.len(),
                out: state.id_out.len(),
                subjects: self.number_of_subjects as usize,
                max: self.max_y.get(&group).copied().unwrap_or(0.0),
                choice: cell.choice.unwrap_or(Choice::Constant),
                const_offer: state.const_offer.get(&subject).copied().unwrap_or(0.0),
                rand_offer: state.rand_offer.get(&subject).copied().unwrap_or(0.0),
            });
        }
    }

    /// Terminal iteration boundary: the monitor asked to end the test and
    /// the last expected submission just landed.
    fn finalize_end(
        &mut self,
        completed: IterNo,
        old_averages: &HashMap<GroupNo, f64>,
    ) -> AdvanceEffect {
        self.testing_in_progress = false;
        let round = self.current_round;
        let period = completed.saturating_sub(1) as usize;
        let practice = self.practice_mode as u8;

        let mut thetas = HashMap::new();
        for group in 1..=self.number_of_groups {
            thetas.insert(group, self.payoffs.theta(period, group));
        }

        let parked = self.registry.drain_parked();
        for client in parked {
            if let Some((group, subject)) = self.subject_pos(client.real_id) {
                let cell = self.cell(CellKey {
                    round,
                    group,
                    iteration: completed,
                    subject,
                });
                self.output.push(CsvRow {
                    global_id: self.registry.global_id(&client.id).unwrap_or(client.real_id),
                    player_id: subject,
                    group,
                    choice: cell.choice.map(Choice::csv_code).unwrap_or(1),
                    payoff: cell.value,
                    period: completed,
                    round,
                    theta: thetas.get(&group).copied().unwrap_or(0.0),
                    x: old_averages.get(&group).copied().unwrap_or(0.0),
                    practice,
                    rand_offer: cell.rand_offer,
                    const_offer: cell.const_offer,
                });
            }
            client.respond(SubjectUpdate::FinalizeEnd);
        }

        let (filename, contents) = self.render_output(false);
        AdvanceEffect::FinalFlush { filename, contents }
    }

    /// Iteration cap reached: snapshot the data, start the next round and
    /// hand every subject a reshuffled identity.
    fn roll_round(&mut self) -> AdvanceEffect {
        let (filename, contents) = self.render_output(true);

        // fresh latent processes for the new round
        self.payoffs.round_changed();
        self.start_round_state();

        let size = self.config.people_per_group;
        let pinned = self.config.constant_groups.clone();
        let mut pool: Vec<RealId> = (1..=self.number_of_subjects)
            .filter(|&id| !pinned.contains(&group_no(id, size)))
            .collect();
        pool.shuffle(&mut self.shuffle_rng);

        let round = self.current_round;
        let mut averages = HashMap::new();
        for group in 1..=self.number_of_groups {
            let in_values = self
                .groups
                .get(&GroupKey { round, group })
                .map(|s| s.in_values.clone())
                .unwrap_or_default();
            averages.insert(group, stats::mean(&in_values));
            self.raise_max_y(group, stats::max(&in_values));
        }

        let initial = self.config.initial_value;
        let parked = self.registry.drain_parked();
        for client in parked {
            let old_real = client.real_id;
            let keeps_id = old_real > 0 && pinned.contains(&group_no(old_real, size));
            let new_real = if keeps_id {
                old_real
            } else {
                pool.pop().unwrap_or(old_real)
            };
            self.registry.assign_real_id(&client.id, new_real);

            let (group, subject) = match self.subject_pos(new_real) {
                Some(pos) => pos,
                None => {
                    client.respond(SubjectUpdate::Superseded);
                    continue;
                }
            };
            let state = self
                .groups
                .get(&GroupKey { round, group })
                .cloned()
                .unwrap_or_default();
            let average = averages.get(&group).copied().unwrap_or(0.0);
            client.respond(SubjectUpdate::Restart {
                value: initial,
                average_value: average,
                new_realid: new_real,
                iteration: 0,
                round,
                in_count: state.id_in.len(),
                out: state.id_out.len(),
                subjects: state.subjects(),
                accumulation: initial,
                average_accumulation: average,
                max: self.max_y.get(&group).copied().unwrap_or(0.0),
                const_offer: state.const_offer.get(&subject).copied().unwrap_or(0.0),
                rand_offer: state.rand_offer.get(&subject).copied().unwrap_or(0.0),
            });
        }

        AdvanceEffect::TempFlush { filename, contents }
    }

    /// Monitor's end-test: everyone parked learns the test is over; the
    /// monitor either gets the terminal marker now (empty cohort) or waits
    /// for the in-flight iteration to finish.
    pub fn end_test(&mut self) -> EndTestOutcome {
        self.registry.broadcast_all(|_, _| SubjectUpdate::End);
        if self.registry.admitted_count() == 0 {
            EndTestOutcome::Immediate(MonitorReply::Terminal)
        } else {
            EndTestOutcome::Parked(self.registry.park_monitor())
        }
    }

    fn render_output(&self, temporary: bool) -> (String, String) {
        let format = self.config.output_format;
        let millis = chrono::Utc::now().timestamp_millis();
        let filename = if temporary {
            format!("output{}.tmp.{}", millis, format.extension())
        } else {
            format!("output{}.{}", millis, format.extension())
        };
        (filename, self.output.render(format))
    }

    /// Post-flush cleanup when the operator wants a fresh slate after every
    /// written output file.
    pub(crate) fn clear_collected_data(&mut self) {
        self.output.clear();
        self.groups.clear();
        self.cells.clear();
        self.iter_stats.clear();
        self.submissions.clear();
        self.current_round = 0;
    }
}

impl AppState {
    pub async fn start_test(&self) {
        self.core.lock().await.start_test();
    }

    pub async fn end_test(&self) -> EndTestOutcome {
        self.core.lock().await.end_test()
    }

    pub async fn kill_everything(&self) {
        self.core.lock().await.kill_everything();
    }

    /// Carry out the flush an advance asked for. Still under the caller's
    /// core lock, so nothing interleaves with the transition.
    pub(crate) async fn perform_flush(&self, core: &mut ExperimentCore, effect: AdvanceEffect) {
        match effect {
            AdvanceEffect::None => {}
            AdvanceEffect::TempFlush { filename, contents } => {
                match self.writer.flush(&filename, &contents).await {
                    Ok(location) => tracing::info!("Temporary round snapshot at {}", location),
                    Err(e) => tracing::error!("Temporary snapshot failed: {}", e),
                }
            }
            AdvanceEffect::FinalFlush { filename, contents } => {
                let reply = match self.writer.flush(&filename, &contents).await {
                    Ok(location) => MonitorReply::OutputLocation(location),
                    Err(e) => {
                        tracing::error!("Final output flush failed: {}", e);
                        MonitorReply::Terminal
                    }
                };
                core.registry.resolve_monitor(reply);
                if self.config.clear_data_on_write {
                    core.clear_collected_data();
                }
            }
        }
    }
}
