//! Formula tokenizer

use super::parser::ParseError;
use logos::Logos;

/// Formula token.
///
/// Keywords are matched as exact tokens and win over the identifier rule
/// only when the whole word matches, so `andy` is an identifier.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token {
    /// Number literal (e.g. 3, 2.5, .5, 1e3)
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", parse_number)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_number)]
    Number(f64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Keywords
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("if")]
    If,
    #[token("else")]
    Else,

    // Arithmetic
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    StarStar,
    #[token("/")]
    Slash,
    #[token("//")]
    SlashSlash,
    #[token("%")]
    Percent,

    // Comparison
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
}

fn parse_number(lex: &mut logos::Lexer<Token>) -> Option<f64> {
    lex.slice().parse::<f64>().ok()
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", n),
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::And => "'and'".into(),
            Token::Or => "'or'".into(),
            Token::Not => "'not'".into(),
            Token::If => "'if'".into(),
            Token::Else => "'else'".into(),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::StarStar => "'**'".into(),
            Token::Slash => "'/'".into(),
            Token::SlashSlash => "'//'".into(),
            Token::Percent => "'%'".into(),
            Token::Lt => "'<'".into(),
            Token::Le => "'<='".into(),
            Token::Gt => "'>'".into(),
            Token::Ge => "'>='".into(),
            Token::EqEq => "'=='".into(),
            Token::NotEq => "'!='".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Comma => "','".into(),
            Token::Dot => "'.'".into(),
        }
    }
}

/// A token with its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

/// Split formula text into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut tokens = Vec::new();

    for (result, span) in Token::lexer(source).spanned() {
        match result {
            Ok(token) => tokens.push(Spanned {
                token,
                pos: span.start,
            }),
            Err(()) => {
                let text = &source[span.clone()];
                return Err(match text.chars().next() {
                    Some(c) if c.is_ascii_digit() || c == '.' => ParseError::InvalidNumber {
                        text: text.to_string(),
                        pos: span.start,
                    },
                    Some(ch) => ParseError::UnexpectedChar {
                        ch,
                        pos: span.start,
                    },
                    None => ParseError::UnexpectedEnd {
                        expected: "a token",
                    },
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(
            kinds("a ** b // c <= d != e"),
            vec![
                Token::Ident("a".into()),
                Token::StarStar,
                Token::Ident("b".into()),
                Token::SlashSlash,
                Token::Ident("c".into()),
                Token::Le,
                Token::Ident("d".into()),
                Token::NotEq,
                Token::Ident("e".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 .5 1e3 2E-2"),
            vec![
                Token::Number(1.0),
                Token::Number(2.5),
                Token::Number(0.5),
                Token::Number(1000.0),
                Token::Number(0.02),
            ]
        );
    }

    #[test]
    fn test_attribute_access_is_dot_token() {
        assert_eq!(
            kinds("math.sqrt"),
            vec![
                Token::Ident("math".into()),
                Token::Dot,
                Token::Ident("sqrt".into())
            ]
        );
    }

    #[test]
    fn test_rejects_unknown_characters() {
        assert_eq!(
            tokenize("a; b"),
            Err(ParseError::UnexpectedChar { ch: ';', pos: 1 })
        );
        assert!(tokenize("__import__('os')").is_err());
        assert!(matches!(
            tokenize("x $ 1"),
            Err(ParseError::UnexpectedChar { ch: '$', pos: 2 })
        ));
    }

    #[test]
    fn test_keywords_only_match_whole_words() {
        assert_eq!(
            kinds("android or notable"),
            vec![
                Token::Ident("android".into()),
                Token::Or,
                Token::Ident("notable".into()),
            ]
        );
    }

    #[test]
    fn test_spans_are_byte_offsets() {
        let spans: Vec<usize> = tokenize("  x **\t2.5")
            .unwrap()
            .into_iter()
            .map(|s| s.pos)
            .collect();
        assert_eq!(spans, vec![2, 4, 7]);
    }
}
