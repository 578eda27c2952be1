//! Scenario sampling
//!
//! Resolves the textual variable declarations of a model into typed
//! distributions and draws independent scenarios from them.
//!
//! # Key Principles
//!
//! 1. **Determinism**: Same seed + same model → same scenarios
//! 2. **Independence**: Each variable is drawn separately per scenario;
//!    no correlation beyond what the distributions encode
//! 3. **Fail fast**: An unknown distribution kind aborts the whole run
//!    before a single scenario is produced
//!
//! # Example
//!
//! ```
//! use montecarlo_core::models::VariableSpec;
//! use montecarlo_core::scenarios::ScenarioSampler;
//! use montecarlo_core::RngManager;
//! use std::collections::BTreeMap;
//!
//! let mut variables = BTreeMap::new();
//! variables.insert(
//!     "X".to_string(),
//!     VariableSpec::new("uniform", &[("low", 0.0), ("high", 1.0)]),
//! );
//!
//! let sampler = ScenarioSampler::new(&variables).unwrap();
//! let mut rng = RngManager::new(42);
//! let scenario = sampler.sample(&mut rng);
//! assert!((0.0..1.0).contains(&scenario["X"]));
//! ```

use crate::models::{Scenario, VariableSpec};
use crate::rng::{RngManager, POISSON_MAX_LAM};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while resolving variable declarations
#[derive(Debug, Error, PartialEq)]
pub enum SamplingError {
    #[error("Unknown distribution '{kind}' for variable '{variable}'")]
    UnknownDistribution { variable: String, kind: String },

    #[error("Variable '{variable}' ({kind}) is missing parameter '{param}'")]
    MissingParameter {
        variable: String,
        kind: &'static str,
        param: &'static str,
    },

    #[error("Variable '{variable}': {reason}")]
    InvalidParameter { variable: String, reason: String },
}

/// A resolved variable distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    /// Gaussian with mean `loc` and standard deviation `scale`
    Normal { loc: f64, scale: f64 },

    /// Continuous uniform over `[low, high)`
    Uniform { low: f64, high: f64 },

    /// Poisson counts with rate `lam`
    Poisson { lam: f64 },
}

impl Distribution {
    /// Resolve a declaration into a typed distribution.
    pub fn from_spec(variable: &str, spec: &VariableSpec) -> Result<Self, SamplingError> {
        let kind = spec.distribution.trim().to_ascii_lowercase();
        let param = |kind: &'static str, name: &'static str| -> Result<f64, SamplingError> {
            let value = spec
                .params
                .get(name)
                .copied()
                .ok_or_else(|| SamplingError::MissingParameter {
                    variable: variable.to_string(),
                    kind,
                    param: name,
                })?;
            if !value.is_finite() {
                return Err(SamplingError::InvalidParameter {
                    variable: variable.to_string(),
                    reason: format!("{} must be finite", name),
                });
            }
            Ok(value)
        };
        let invalid = |reason: String| SamplingError::InvalidParameter {
            variable: variable.to_string(),
            reason,
        };

        match kind.as_str() {
            "normal" => {
                let loc = param("normal", "loc")?;
                let scale = param("normal", "scale")?;
                if scale < 0.0 {
                    return Err(invalid(format!("scale must be >= 0, got {}", scale)));
                }
                Ok(Distribution::Normal { loc, scale })
            }
            "uniform" => {
                let low = param("uniform", "low")?;
                let high = param("uniform", "high")?;
                if high <= low {
                    return Err(invalid(format!(
                        "uniform needs low < high, got [{}, {})",
                        low, high
                    )));
                }
                Ok(Distribution::Uniform { low, high })
            }
            "poisson" => {
                let lam = param("poisson", "lam")?;
                if lam < 0.0 {
                    return Err(invalid(format!("lam must be >= 0, got {}", lam)));
                }
                if lam > POISSON_MAX_LAM {
                    return Err(invalid(format!(
                        "lam must be <= {:e}, got {:e}",
                        POISSON_MAX_LAM, lam
                    )));
                }
                Ok(Distribution::Poisson { lam })
            }
            _ => Err(SamplingError::UnknownDistribution {
                variable: variable.to_string(),
                kind: spec.distribution.clone(),
            }),
        }
    }

    /// Draw one value.
    pub fn sample(&self, rng: &mut RngManager) -> f64 {
        match *self {
            Distribution::Normal { loc, scale } => rng.normal(loc, scale),
            Distribution::Uniform { low, high } => rng.uniform(low, high),
            Distribution::Poisson { lam } => rng.poisson(lam) as f64,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Distribution::Normal { .. } => "normal",
            Distribution::Uniform { .. } => "uniform",
            Distribution::Poisson { .. } => "poisson",
        }
    }
}

/// Draws whole scenarios from a model's variables
#[derive(Debug, Clone)]
pub struct ScenarioSampler {
    variables: Vec<(String, Distribution)>,
}

impl ScenarioSampler {
    /// Resolve every variable up front.
    ///
    /// # Errors
    ///
    /// The first unresolvable variable (in name order) is reported.
    pub fn new(variables: &BTreeMap<String, VariableSpec>) -> Result<Self, SamplingError> {
        let variables = variables
            .iter()
            .map(|(name, spec)| Ok((name.clone(), Distribution::from_spec(name, spec)?)))
            .collect::<Result<Vec<_>, SamplingError>>()?;
        Ok(Self { variables })
    }

    /// Draw one independent scenario.
    pub fn sample(&self, rng: &mut RngManager) -> Scenario {
        self.variables
            .iter()
            .map(|(name, dist)| (name.clone(), dist.sample(rng)))
            .collect()
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &Distribution)> {
        self.variables.iter().map(|(name, dist)| (name.as_str(), dist))
    }
}
