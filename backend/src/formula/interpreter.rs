// Formula interpreter
//
// Walks a parsed expression against one scenario's variable bindings.
// Evaluation is pure: same tree + same bindings → same result.

use super::functions::{constant, power};
use super::types::{BinaryOp, Expr, UnaryOp};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors that can occur while evaluating a formula
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Math domain error in {0}")]
    MathDomain(&'static str),

    #[error("Result is not a finite number")]
    NonFinite,
}

/// Source of variable values for one evaluation
pub trait Bindings {
    fn lookup(&self, name: &str) -> Option<f64>;
}

impl Bindings for BTreeMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl Bindings for HashMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl Bindings for [(&str, f64)] {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

/// Evaluate a whole formula; the final value must be finite.
pub fn evaluate<B: Bindings + ?Sized>(expr: &Expr, bindings: &B) -> Result<f64, EvalError> {
    let value = evaluate_expr(expr, bindings)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EvalError::NonFinite)
    }
}

/// Evaluate a sub-expression. Intermediate infinities are allowed
/// (`x < inf` is legal); only the final result is checked.
pub fn evaluate_expr<B: Bindings + ?Sized>(expr: &Expr, bindings: &B) -> Result<f64, EvalError> {
    match expr {
        Expr::Number(value) => Ok(*value),

        // Scenario variables shadow constants, so a variable named `e` works
        Expr::Name(name) => bindings
            .lookup(name)
            .or_else(|| constant(name))
            .ok_or_else(|| EvalError::UnknownIdentifier(name.clone())),

        Expr::Unary { op, operand } => {
            let value = evaluate_expr(operand, bindings)?;
            Ok(match op {
                UnaryOp::Neg => -value,
                UnaryOp::Pos => value,
                UnaryOp::Not => bool_value(!truthy(value)),
            })
        }

        Expr::Binary { op, left, right } => {
            let l = evaluate_expr(left, bindings)?;
            let r = evaluate_expr(right, bindings)?;
            apply_binary(*op, l, r)
        }

        Expr::Compare { first, rest } => {
            let mut left = evaluate_expr(first, bindings)?;
            for (op, expr) in rest {
                let right = evaluate_expr(expr, bindings)?;
                if !op.apply(left, right) {
                    return Ok(0.0);
                }
                left = right;
            }
            Ok(1.0)
        }

        Expr::And(left, right) => {
            let l = evaluate_expr(left, bindings)?;
            if truthy(l) {
                evaluate_expr(right, bindings)
            } else {
                Ok(l)
            }
        }

        Expr::Or(left, right) => {
            let l = evaluate_expr(left, bindings)?;
            if truthy(l) {
                Ok(l)
            } else {
                evaluate_expr(right, bindings)
            }
        }

        Expr::Conditional {
            condition,
            then,
            otherwise,
        } => {
            if truthy(evaluate_expr(condition, bindings)?) {
                evaluate_expr(then, bindings)
            } else {
                evaluate_expr(otherwise, bindings)
            }
        }

        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|arg| evaluate_expr(arg, bindings))
                .collect::<Result<Vec<f64>, EvalError>>()?;
            function.apply(&values)
        }
    }
}

fn apply_binary(op: BinaryOp, l: f64, r: f64) -> Result<f64, EvalError> {
    match op {
        BinaryOp::Add => Ok(l + r),
        BinaryOp::Sub => Ok(l - r),
        BinaryOp::Mul => Ok(l * r),
        BinaryOp::Div => {
            if r == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(l / r)
        }
        BinaryOp::FloorDiv => {
            if r == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok((l / r).floor())
        }
        BinaryOp::Mod => {
            if r == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            // Result takes the sign of the divisor
            let m = l % r;
            if m != 0.0 && (m < 0.0) != (r < 0.0) {
                Ok(m + r)
            } else {
                Ok(m)
            }
        }
        BinaryOp::Pow => power(l, r, "**"),
    }
}

fn truthy(value: f64) -> bool {
    value != 0.0
}

fn bool_value(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}
