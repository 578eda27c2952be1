// Formula parser
//
// Recursive descent over the token stream, loosest binding first:
//
//   conditional  := or_expr ['if' or_expr 'else' conditional]
//   or_expr      := and_expr ('or' and_expr)*
//   and_expr     := not_expr ('and' not_expr)*
//   not_expr     := 'not' not_expr | comparison
//   comparison   := arith (cmp_op arith)*
//   arith        := term (('+' | '-') term)*
//   term         := factor (('*' | '/' | '//' | '%') factor)*
//   factor       := ('+' | '-') factor | power
//   power        := primary ['**' factor]
//   primary      := NUMBER | NAME | call | 'math' '.' NAME [args] | '(' conditional ')'
//
// Function names and `math.` constants are resolved here, so a formula
// that parses only ever fails later on bindings or arithmetic.

use super::functions::{constant, Builtin};
use super::lexer::{tokenize, Spanned, Token};
use super::types::{BinaryOp, CompareOp, Expr, UnaryOp};
use thiserror::Error;

/// Maximum nesting of sub-expressions
pub const MAX_DEPTH: usize = 128;

/// Errors that can occur while parsing a formula
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("Unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("Invalid number '{text}' at offset {pos}")]
    InvalidNumber { text: String, pos: usize },

    #[error("Expected {expected}, found {found} at offset {pos}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        pos: usize,
    },

    #[error("Expected {expected}, found end of formula")]
    UnexpectedEnd { expected: &'static str },

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown constant: math.{0}")]
    UnknownConstant(String),

    #[error("Function {function} takes {expected} argument(s), got {found}")]
    Arity {
        function: &'static str,
        expected: String,
        found: usize,
    },

    #[error("Formula nesting exceeds maximum depth ({MAX_DEPTH})")]
    TooDeep,

    #[error("Empty formula")]
    Empty,
}

/// Parse formula text into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.conditional()?;

    match parser.peek() {
        None => Ok(expr),
        Some(_) => Err(parser.unexpected("end of formula")),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    // ------------------------------------------------------------------
    // Token stream helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|s| s.token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &'static str) -> Result<(), ParseError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        match self.tokens.get(self.cursor) {
            Some(spanned) => ParseError::UnexpectedToken {
                found: spanned.token.describe(),
                expected,
                pos: spanned.pos,
            },
            None => ParseError::UnexpectedEnd { expected },
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep);
        }
        let result = f(self);
        self.depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Grammar
    // ------------------------------------------------------------------

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| {
            let then = p.or_expr()?;
            if !p.eat(&Token::If) {
                return Ok(then);
            }
            let condition = p.or_expr()?;
            p.expect(Token::Else, "'else'")?;
            let otherwise = p.conditional()?;
            Ok(Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        })
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            let operand = self.nested(|p| p.not_expr())?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let first = self.arith()?;
        let mut rest = Vec::new();

        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CompareOp::Lt,
                Some(Token::Le) => CompareOp::Le,
                Some(Token::Gt) => CompareOp::Gt,
                Some(Token::Ge) => CompareOp::Ge,
                Some(Token::EqEq) => CompareOp::Eq,
                Some(Token::NotEq) => CompareOp::Ne,
                _ => break,
            };
            self.cursor += 1;
            rest.push((op, self.arith()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            let right = self.term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::SlashSlash) => BinaryOp::FloorDiv,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.cursor += 1;
            let right = self.factor()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Plus) => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.cursor += 1;
        let operand = self.nested(|p| p.factor())?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.primary()?;
        if self.eat(&Token::StarStar) {
            // Right-associative, and the exponent may carry a unary sign
            let exponent = self.nested(|p| p.factor())?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if name == "math" && self.peek() == Some(&Token::Dot) => {
                self.cursor += 1;
                let member = match self.peek() {
                    Some(Token::Ident(member)) => member.clone(),
                    _ => return Err(self.unexpected("name after 'math.'")),
                };
                self.cursor += 1;
                if self.peek() == Some(&Token::LParen) {
                    self.call(&member)
                } else {
                    constant(&member)
                        .map(Expr::Number)
                        .ok_or(ParseError::UnknownConstant(member))
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.call(&name)
                } else {
                    Ok(match name.as_str() {
                        "True" => Expr::Number(1.0),
                        "False" => Expr::Number(0.0),
                        _ => Expr::Name(name),
                    })
                }
            }
            Some(_) => {
                self.cursor -= 1;
                Err(self.unexpected("a number, name or '('"))
            }
            None => Err(ParseError::UnexpectedEnd {
                expected: "a number, name or '('",
            }),
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, ParseError> {
        let function =
            Builtin::lookup(name).ok_or_else(|| ParseError::UnknownFunction(name.to_string()))?;

        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.conditional()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma, "',' or ')'")?;
            }
        }

        if !function.accepts(args.len()) {
            let (min, max) = function.arity();
            let expected = match max {
                Some(max) if max == min => min.to_string(),
                Some(max) => format!("{} to {}", min, max),
                None => format!("at least {}", min),
            };
            return Err(ParseError::Arity {
                function: function.name(),
                expected,
                found: args.len(),
            });
        }

        Ok(Expr::Call { function, args })
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
