//! Sandboxed model formulas
//!
//! Formulas are parsed by a purpose-built parser into a small expression
//! tree and evaluated directly against scenario bindings. There is no path
//! from a formula to host code: the only callables are the allow-listed
//! math functions in [`functions`], and the only names are scenario
//! variables and math constants.
//!
//! # Example
//!
//! ```
//! use montecarlo_core::formula::Formula;
//! use std::collections::BTreeMap;
//!
//! let formula = Formula::parse("math.sqrt(X) * 2 + max(Y, 0)").unwrap();
//!
//! let mut scenario = BTreeMap::new();
//! scenario.insert("X".to_string(), 16.0);
//! scenario.insert("Y".to_string(), -3.0);
//!
//! assert_eq!(formula.evaluate(&scenario).unwrap(), 8.0);
//! ```

pub mod functions;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod types;

pub use functions::Builtin;
pub use interpreter::{Bindings, EvalError};
pub use parser::ParseError;
pub use types::Expr;

use std::collections::BTreeSet;
use thiserror::Error;

/// Either stage of turning formula text into a number
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormulaError {
    #[error("Malformed formula: {0}")]
    Parse(#[from] ParseError),

    #[error("Evaluation failed: {0}")]
    Eval(#[from] EvalError),
}

/// A compiled model formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse and resolve formula text.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let expr = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate against one scenario.
    pub fn evaluate<B: Bindings + ?Sized>(&self, bindings: &B) -> Result<f64, EvalError> {
        interpreter::evaluate(&self.expr, bindings)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Bare names the formula reads (variables, or constants if unbound).
    pub fn names(&self) -> BTreeSet<String> {
        let mut names = Vec::new();
        self.expr.collect_names(&mut names);
        names.into_iter().map(str::to_string).collect()
    }
}

/// Parse and evaluate in one step.
pub fn evaluate<B: Bindings + ?Sized>(source: &str, bindings: &B) -> Result<f64, FormulaError> {
    let formula = Formula::parse(source)?;
    Ok(formula.evaluate(bindings)?)
}
