//! Model file
//!
//! A model declares the formula every worker evaluates, the variables the
//! producer samples, and how many scenarios to generate. It is loaded once
//! per run and never mutated afterwards.
//!
//! ```text
//! {
//!   "model_function": "price * quantity - cost",
//!   "variables": {
//!     "price":    { "distribution": "normal",  "params": { "loc": 10, "scale": 2 } },
//!     "quantity": { "distribution": "poisson", "params": { "lam": 100 } },
//!     "cost":     { "distribution": "uniform", "params": { "low": 500, "high": 800 } }
//!   },
//!   "simulation_count": 100000
//! }
//! ```

use crate::config::{read_structured, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Declared distribution of one model variable.
///
/// The distribution kind stays textual here; it is resolved (and rejected
/// if unknown) when the producer builds its sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Distribution kind: "normal", "uniform" or "poisson"
    pub distribution: String,

    /// Kind-specific parameters (loc/scale, low/high, lam)
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl VariableSpec {
    pub fn new(distribution: impl Into<String>, params: &[(&str, f64)]) -> Self {
        Self {
            distribution: distribution.into(),
            params: params
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
        }
    }
}

/// A complete simulation model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    /// Formula evaluated per scenario
    pub model_function: String,

    /// Variable name → distribution
    pub variables: BTreeMap<String, VariableSpec>,

    /// Number of scenarios to generate
    pub simulation_count: u64,
}

impl ModelFile {
    /// Load a model from `.json`, `.jsonc`, `.json5` or `.toml`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let model: Self = read_structured(path.as_ref())?;
        model.validate()?;
        Ok(model)
    }

    /// Parse a model from JSON5 text (comments and trailing commas allowed).
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let model: Self = json5::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    /// Structural checks that do not depend on distribution kinds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_function.trim().is_empty() {
            return Err(ConfigError::Invalid("model_function must not be empty".into()));
        }
        if let Some(name) = self.variables.keys().find(|name| !is_identifier(name)) {
            return Err(ConfigError::Invalid(format!(
                "variable name '{}' is not a valid identifier",
                name
            )));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
