//! Stochastic payoff generation.
//!
//! Each group shares a slowly mean-reverting latent process:
//!
//! ```text
//! Theta[0]   = theta_0
//! Theta[t+1] = alpha + rho * (Theta[t] - alpha) + sigma_theta * omega,  omega ~ N(0, 1)
//! ```
//!
//! A subject's observable value for period t is `Theta[t] + epsilon` with
//! `epsilon ~ N(0, noise_sd^2)`. The latent history is memoized per group so
//! repeated reads of the same period within a round are bit-identical; the
//! observation noise is drawn fresh on every call, and whoever hands the value
//! to a subject is responsible for caching it in the experiment state.

use crate::config::LabConfig;
use crate::types::GroupNo;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::HashMap;

pub struct PayoffGenerator {
    theta_0: f64,
    alpha: f64,
    rho: f64,
    sigma_theta: f64,
    noise_sd: f64,
    constant_payoff: f64,
    /// Latent history per group, index = period
    theta: HashMap<GroupNo, Vec<f64>>,
    rng: StdRng,
}

impl PayoffGenerator {
    pub fn new(config: &LabConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Seeded constructor for deterministic tests.
    pub fn with_rng(config: &LabConfig, rng: StdRng) -> Self {
        Self {
            theta_0: config.theta_0,
            alpha: config.alpha,
            rho: config.rho,
            sigma_theta: config.sigma_theta,
            noise_sd: config.noise_sd,
            constant_payoff: config.constant_payoff,
            theta: HashMap::new(),
            rng,
        }
    }

    /// Latent process value for a period, extending the memoized history
    /// lazily. Once generated, a period's value never changes until
    /// `round_changed`.
    pub fn theta(&mut self, period: usize, group: GroupNo) -> f64 {
        while self.theta.get(&group).map_or(0, Vec::len) <= period {
            let last = self.theta.get(&group).and_then(|h| h.last().copied());
            let next = match last {
                None => self.theta_0,
                Some(current) => {
                    let omega: f64 = self.rng.sample(StandardNormal);
                    self.alpha + self.rho * (current - self.alpha) + self.sigma_theta * omega
                }
            };
            self.theta.entry(group).or_default().push(next);
        }
        self.theta[&group][period]
    }

    /// Observable stochastic payoff for a subject in `group` at `period`.
    /// The noise term is independent per call; callers cache the result.
    pub fn random_value(&mut self, group: GroupNo, period: usize) -> f64 {
        let theta = self.theta(period, group);
        let epsilon: f64 = self.rng.sample::<f64, _>(StandardNormal) * self.noise_sd;
        theta + epsilon
    }

    /// The fixed alternative payoff.
    pub fn constant_value(&self) -> f64 {
        self.constant_payoff
    }

    /// Forget all latent history; the next round starts its own processes.
    pub fn round_changed(&mut self) {
        self.theta.clear();
    }
}
