//! Experiment configuration, fixed at process start.
//!
//! Every knob is read from the environment (a `.env` file is loaded first by
//! `main`), falling back to the defaults the lab has been running with.

use std::time::Duration;

/// Encoding used when the accumulated results are flushed to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LabConfig {
    /// Subjects per group; the last group may be short
    pub people_per_group: u32,
    /// Decision periods per round as configured; one extra period is always
    /// played before the round rolls over (legacy lab convention)
    pub number_of_iterations: u32,
    /// How long a subject may go without a liveness ping before being
    /// dropped; `None` disables eviction entirely
    pub kill_timeout: Option<Duration>,
    /// Payoff every subject restarts from after a round change
    pub initial_value: f64,
    pub output_format: OutputFormat,
    /// Groups whose subjects keep their real ids across round changes
    pub constant_groups: Vec<u32>,
    /// Retry budget for a monitor command carrying the `sync` attribute
    pub max_sync_attempts: u32,
    /// The fixed payoff offered as the alternative to the stochastic stream
    pub constant_payoff: f64,
    /// Whether subjects currently out of the stochastic stream still see it
    pub x_visible_to_out_subjects: bool,
    /// Drop all accumulated result data once the final output file is written
    pub clear_data_on_write: bool,

    // Latent process parameters: Theta[0] = theta_0 and
    // Theta[t+1] = alpha + rho * (Theta[t] - alpha) + sigma_theta * omega
    pub theta_0: f64,
    pub alpha: f64,
    pub rho: f64,
    pub sigma_theta: f64,
    /// Standard deviation of the per-subject observation noise epsilon
    pub noise_sd: f64,

    pub port: u16,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            people_per_group: 2,
            number_of_iterations: 30,
            kill_timeout: Some(Duration::from_millis(5000)),
            initial_value: 0.0,
            output_format: OutputFormat::Csv,
            constant_groups: Vec::new(),
            max_sync_attempts: 5,
            constant_payoff: 80.0,
            x_visible_to_out_subjects: false,
            clear_data_on_write: false,
            theta_0: 100.0,
            alpha: 100.0,
            rho: 0.99,
            sigma_theta: 6.0,
            noise_sd: 1000f64.sqrt(),
            port: 3000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl LabConfig {
    /// Load the configuration from environment variables, keeping the
    /// default for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("PEOPLE_PER_GROUP") {
            config.people_per_group = v;
        }
        if let Some(v) = env_parse("NUMBER_OF_ITERATIONS") {
            config.number_of_iterations = v;
        }
        // KILL_TIMEOUT_MS=null keeps unresponsive subjects around forever
        if let Ok(raw) = std::env::var("KILL_TIMEOUT_MS") {
            if raw.trim() == "null" {
                config.kill_timeout = None;
            } else if let Ok(ms) = raw.trim().parse::<u64>() {
                config.kill_timeout = Some(Duration::from_millis(ms));
            }
        }
        if let Some(v) = env_parse("INITIAL_VALUE") {
            config.initial_value = v;
        }
        if let Ok(raw) = std::env::var("OUTPUT_FORMAT") {
            match raw.trim() {
                "json" => config.output_format = OutputFormat::Json,
                "csv" => config.output_format = OutputFormat::Csv,
                other => {
                    tracing::warn!("Unknown OUTPUT_FORMAT '{}', keeping csv", other);
                }
            }
        }
        if let Ok(raw) = std::env::var("CONSTANT_GROUPS") {
            config.constant_groups = raw
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Some(v) = env_parse("MAX_SYNC_ATTEMPTS") {
            config.max_sync_attempts = v;
        }
        if let Some(v) = env_parse("CONSTANT_PAYOFF") {
            config.constant_payoff = v;
        }
        if let Some(v) = env_parse("X_VISIBLE_TO_OUT_SUBJECTS") {
            config.x_visible_to_out_subjects = v;
        }
        if let Some(v) = env_parse("CLEAR_DATA_ON_WRITE") {
            config.clear_data_on_write = v;
        }
        if let Some(v) = env_parse("THETA_0") {
            config.theta_0 = v;
        }
        if let Some(v) = env_parse("THETA_ALPHA") {
            config.alpha = v;
        }
        if let Some(v) = env_parse("THETA_RHO") {
            config.rho = v;
        }
        if let Some(v) = env_parse("THETA_SIGMA") {
            config.sigma_theta = v;
        }
        if let Some(v) = env_parse("NOISE_SD") {
            config.noise_sd = v;
        }
        if let Some(v) = env_parse("PORT") {
            config.port = v;
        }

        config
    }

    /// Periods actually played per round: the configured count plus one.
    pub fn iteration_amount(&self) -> u32 {
        self.number_of_iterations + 1
    }
}
