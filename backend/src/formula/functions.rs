// Allow-listed math functions
//
// The complete set of callables a formula can reach. Every entry is
// reachable both bare (`sqrt(x)`) and qualified (`math.sqrt(x)`).

use super::interpreter::EvalError;

/// Named constants available under `math.` and as unbound bare names
pub fn constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "tau" => Some(std::f64::consts::TAU),
        "inf" => Some(f64::INFINITY),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Sqrt,
    Exp,
    Expm1,
    Log,
    Log10,
    Log2,
    Log1p,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Pow,
    Fabs,
    Abs,
    Floor,
    Ceil,
    Trunc,
    Round,
    Hypot,
    Min,
    Max,
    Copysign,
    Degrees,
    Radians,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        let builtin = match name {
            "sqrt" => Builtin::Sqrt,
            "exp" => Builtin::Exp,
            "expm1" => Builtin::Expm1,
            "log" => Builtin::Log,
            "log10" => Builtin::Log10,
            "log2" => Builtin::Log2,
            "log1p" => Builtin::Log1p,
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "tan" => Builtin::Tan,
            "asin" => Builtin::Asin,
            "acos" => Builtin::Acos,
            "atan" => Builtin::Atan,
            "atan2" => Builtin::Atan2,
            "sinh" => Builtin::Sinh,
            "cosh" => Builtin::Cosh,
            "tanh" => Builtin::Tanh,
            "pow" => Builtin::Pow,
            "fabs" => Builtin::Fabs,
            "abs" => Builtin::Abs,
            "floor" => Builtin::Floor,
            "ceil" => Builtin::Ceil,
            "trunc" => Builtin::Trunc,
            "round" => Builtin::Round,
            "hypot" => Builtin::Hypot,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "copysign" => Builtin::Copysign,
            "degrees" => Builtin::Degrees,
            "radians" => Builtin::Radians,
            _ => return None,
        };
        Some(builtin)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Sqrt => "sqrt",
            Builtin::Exp => "exp",
            Builtin::Expm1 => "expm1",
            Builtin::Log => "log",
            Builtin::Log10 => "log10",
            Builtin::Log2 => "log2",
            Builtin::Log1p => "log1p",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Asin => "asin",
            Builtin::Acos => "acos",
            Builtin::Atan => "atan",
            Builtin::Atan2 => "atan2",
            Builtin::Sinh => "sinh",
            Builtin::Cosh => "cosh",
            Builtin::Tanh => "tanh",
            Builtin::Pow => "pow",
            Builtin::Fabs => "fabs",
            Builtin::Abs => "abs",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Trunc => "trunc",
            Builtin::Round => "round",
            Builtin::Hypot => "hypot",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Copysign => "copysign",
            Builtin::Degrees => "degrees",
            Builtin::Radians => "radians",
        }
    }

    /// Accepted argument count as (min, max); `None` max is variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Builtin::Log | Builtin::Round => (1, Some(2)),
            Builtin::Atan2 | Builtin::Pow | Builtin::Copysign => (2, Some(2)),
            Builtin::Hypot | Builtin::Min | Builtin::Max => (1, None),
            _ => (1, Some(1)),
        }
    }

    pub fn accepts(self, count: usize) -> bool {
        let (min, max) = self.arity();
        count >= min && max.map_or(true, |max| count <= max)
    }

    /// Apply to already-evaluated arguments. Arity is checked at parse time.
    pub fn apply(self, args: &[f64]) -> Result<f64, EvalError> {
        let x = args.first().copied().unwrap_or(f64::NAN);
        let y = args.get(1).copied();
        let domain = || EvalError::MathDomain(self.name());

        let value = match self {
            Builtin::Sqrt => {
                if x < 0.0 {
                    return Err(domain());
                }
                x.sqrt()
            }
            Builtin::Exp => x.exp(),
            Builtin::Expm1 => x.exp_m1(),
            Builtin::Log => {
                if x <= 0.0 {
                    return Err(domain());
                }
                match y {
                    None => x.ln(),
                    Some(base) => {
                        if base <= 0.0 {
                            return Err(domain());
                        }
                        let denom = base.ln();
                        if denom == 0.0 {
                            return Err(EvalError::DivisionByZero);
                        }
                        x.ln() / denom
                    }
                }
            }
            Builtin::Log10 => {
                if x <= 0.0 {
                    return Err(domain());
                }
                x.log10()
            }
            Builtin::Log2 => {
                if x <= 0.0 {
                    return Err(domain());
                }
                x.log2()
            }
            Builtin::Log1p => {
                if x <= -1.0 {
                    return Err(domain());
                }
                x.ln_1p()
            }
            Builtin::Sin => x.sin(),
            Builtin::Cos => x.cos(),
            Builtin::Tan => x.tan(),
            Builtin::Asin => {
                if !(-1.0..=1.0).contains(&x) {
                    return Err(domain());
                }
                x.asin()
            }
            Builtin::Acos => {
                if !(-1.0..=1.0).contains(&x) {
                    return Err(domain());
                }
                x.acos()
            }
            Builtin::Atan => x.atan(),
            Builtin::Atan2 => x.atan2(y.unwrap_or(f64::NAN)),
            Builtin::Sinh => x.sinh(),
            Builtin::Cosh => x.cosh(),
            Builtin::Tanh => x.tanh(),
            Builtin::Pow => power(x, y.unwrap_or(f64::NAN), "pow")?,
            Builtin::Fabs | Builtin::Abs => x.abs(),
            Builtin::Floor => x.floor(),
            Builtin::Ceil => x.ceil(),
            Builtin::Trunc => x.trunc(),
            Builtin::Round => match y {
                None => x.round_ties_even(),
                Some(digits) => {
                    let scale = 10f64.powi(digits.trunc() as i32);
                    (x * scale).round_ties_even() / scale
                }
            },
            Builtin::Hypot => args.iter().fold(0.0_f64, |acc, v| acc.hypot(*v)),
            Builtin::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Builtin::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Builtin::Copysign => x.copysign(y.unwrap_or(1.0)),
            Builtin::Degrees => x.to_degrees(),
            Builtin::Radians => x.to_radians(),
        };

        Ok(value)
    }
}

/// Real-valued exponentiation shared by `**` and `pow()`.
///
/// Zero to a negative power and a negative base with a fractional exponent
/// have no real result and are rejected.
pub fn power(base: f64, exponent: f64, op: &'static str) -> Result<f64, EvalError> {
    if base == 0.0 && exponent < 0.0 {
        return Err(EvalError::DivisionByZero);
    }
    if base < 0.0 && exponent.is_finite() && exponent.fract() != 0.0 {
        return Err(EvalError::MathDomain(op));
    }
    Ok(base.powf(exponent))
}
