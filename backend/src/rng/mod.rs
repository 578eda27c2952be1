//! Deterministic random number generation
//!
//! Uses xorshift64* for fast, seedable sampling of scenario variables.
//! CRITICAL: All randomness in the pipeline MUST go through this module.

mod xorshift;

pub use xorshift::{RngManager, POISSON_MAX_LAM};
