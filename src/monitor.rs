//! Monitor console authentication.
//!
//! A would-be monitor first requests a challenge, then answers with the
//! keyed transform of it: the normal-curve density at the challenge value,
//! floored to 4 decimal digits, stringified and pushed through SHA-256. The
//! monitor page ships the same transform; anything else never reaches the
//! privileged command dispatch.

use crate::types::MonitorId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

// Curve parameters; must match the monitor console's access key file.
const CURVE_MU: f64 = 0.772313;
const CURVE_GAMMA: f64 = 0.95819;

pub struct MonitorAuthority {
    /// Outstanding challenge per monitor id; a fresh request overwrites any
    /// unconsumed one, so stale challenges cannot be redeemed
    challenges: HashMap<MonitorId, f64>,
    rng: StdRng,
}

impl Default for MonitorAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorAuthority {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            challenges: HashMap::new(),
            rng,
        }
    }

    /// Issue a fresh challenge for a monitor id, replacing any prior one.
    pub fn issue_challenge(&mut self, monitor_id: &str) -> String {
        let challenge: f64 = self.rng.random();
        self.challenges.insert(monitor_id.to_string(), challenge);
        challenge.to_string()
    }

    /// Check a challenge response. Returns false, never errors, when no
    /// challenge is outstanding or the response does not match. The
    /// challenge stays valid until replaced or the state is reset, so a
    /// monitor can run several commands off one handshake.
    pub fn verify(&self, monitor_id: &str, response: &str) -> bool {
        match self.challenges.get(monitor_id) {
            Some(&challenge) => response == expected_response(challenge),
            None => false,
        }
    }

    /// Forget all outstanding challenges.
    pub fn clear(&mut self) {
        self.challenges.clear();
    }
}

/// The transform a legitimate monitor applies to its challenge.
pub fn expected_response(challenge: f64) -> String {
    let density = normal_density(CURVE_MU, CURVE_GAMMA, challenge);
    let quantized = quantized_string(density);
    let digest = Sha256::digest(quantized.as_bytes());
    hex::encode(digest)
}

/// Normal-curve density with mean `mu` and spread `gamma`.
fn normal_density(mu: f64, gamma: f64, x: f64) -> f64 {
    (1.0 / (2.0 * gamma * std::f64::consts::PI).sqrt())
        * (-(x - mu).powi(2) / 2.0 / gamma).exp()
}

/// Floor to 4 decimal digits and render the way the monitor's JavaScript
/// stringifies numbers: no trailing zeros, no trailing dot.
fn quantized_string(v: f64) -> String {
    let scaled = (v * 10000.0).floor() as i64;
    let whole = scaled / 10000;
    let frac = scaled % 10000;
    if frac == 0 {
        whole.to_string()
    } else {
        let s = format!("{}.{:04}", whole, frac);
        s.trim_end_matches('0').to_string()
    }
}
