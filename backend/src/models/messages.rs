//! Wire messages exchanged through the broker
//!
//! - Scenario: JSON object, variable name → sampled number
//! - ResultMessage: `{"worker": <id>, "result": <number>}`
//! - ModelRecord: formula plus content version, used by the slot
//!   distribution mode (the queue mode ships raw formula text)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One sampled set of variable values.
///
/// Ordered so that serialized scenarios are byte-stable for a given seed.
pub type Scenario = BTreeMap<String, f64>;

/// Result of evaluating one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Identity of the worker that produced the value
    #[serde(rename = "worker")]
    pub worker_id: String,

    /// Evaluated formula value
    #[serde(rename = "result")]
    pub value: f64,
}

impl ResultMessage {
    pub fn new(worker_id: impl Into<String>, value: f64) -> Self {
        Self {
            worker_id: worker_id.into(),
            value,
        }
    }
}

/// A versioned model formula.
///
/// The version is the SHA-256 of the formula text, so two records with the
/// same version are interchangeable and re-reading a slot is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub version: String,
    pub formula: String,
}

impl ModelRecord {
    pub fn new(formula: impl Into<String>) -> Self {
        let formula = formula.into();
        let version = fingerprint(&formula);
        Self { version, formula }
    }
}

/// Hex SHA-256 of a formula.
pub fn fingerprint(formula: &str) -> String {
    let digest = Sha256::digest(formula.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
