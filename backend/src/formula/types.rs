// Formula AST
//
// Parsed once per model and evaluated once per scenario. Only arithmetic,
// comparison, boolean and allow-listed function nodes exist; there is no
// node that can reach outside the scenario bindings.

use super::functions::Builtin;

// ============================================================================
// OPERATORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Floor division (`//`)
    FloorDiv,
    /// Modulo with the sign of the divisor (`%`)
    Mod,
    /// Exponentiation (`**`)
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn apply(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
        }
    }
}

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// A formula expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal or resolved `math.` constant
    Number(f64),

    /// Bare identifier: a scenario variable, or a constant if unbound
    Name(String),

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Chained comparison: `a < b <= c` means `a < b and b <= c`
    Compare {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },

    /// Short-circuit `and`; yields the deciding operand
    And(Box<Expr>, Box<Expr>),

    /// Short-circuit `or`; yields the deciding operand
    Or(Box<Expr>, Box<Expr>),

    /// `then if condition else otherwise`
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },

    /// Call to an allow-listed function
    Call { function: Builtin, args: Vec<Expr> },
}

impl Expr {
    /// Collect every bare identifier referenced by the expression.
    pub fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Name(name) => out.push(name),
            Expr::Unary { operand, .. } => operand.collect_names(out),
            Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_names(out);
                right.collect_names(out);
            }
            Expr::Compare { first, rest } => {
                first.collect_names(out);
                for (_, expr) in rest {
                    expr.collect_names(out);
                }
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                then.collect_names(out);
                condition.collect_names(out);
                otherwise.collect_names(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_names(out);
                }
            }
        }
    }
}
