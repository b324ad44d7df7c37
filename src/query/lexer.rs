//! Query tokenizer.
//!
//! Whitespace and commas separate tokens; `//` comments run to end of line.
//! Keywords are `[A-Za-z_:@]+` (tag keys like `addr:housenumber` are single
//! keywords). Numbers may carry a sign and a fractional part. Anything else
//! is an error carrying its byte position.

use crate::error::{OsmGridError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Number,
    Operator,
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,
    Dot,
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte offset of the token's first character in the query text.
    pub pos: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, pos: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            pos,
        }
    }
}

fn is_keyword_char(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':' || c == '@'
}

pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' | ',' => {
                chars.next();
            }
            '/' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '/')) => {
                        // Comment to end of line.
                        for (_, c) in chars.by_ref() {
                            if c == '\n' {
                                break;
                            }
                        }
                    }
                    _ => {
                        return Err(unexpected(pos, '/'));
                    }
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::new(TokenKind::OpenParen, "(", pos));
            }
            ')' => {
                chars.next();
                tokens.push(Token::new(TokenKind::CloseParen, ")", pos));
            }
            '{' => {
                chars.next();
                tokens.push(Token::new(TokenKind::OpenBrace, "{", pos));
            }
            '}' => {
                chars.next();
                tokens.push(Token::new(TokenKind::CloseBrace, "}", pos));
            }
            '.' => {
                chars.next();
                tokens.push(Token::new(TokenKind::Dot, ".", pos));
            }
            '*' => {
                chars.next();
                tokens.push(Token::new(TokenKind::Wildcard, "*", pos));
            }
            '=' => {
                chars.next();
                tokens.push(Token::new(TokenKind::Operator, "=", pos));
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    tokens.push(Token::new(TokenKind::Operator, "!=", pos));
                } else {
                    tokens.push(Token::new(TokenKind::Operator, "!", pos));
                }
            }
            '<' | '>' => {
                chars.next();
                if matches!(chars.peek(), Some(&(_, '='))) {
                    chars.next();
                    tokens.push(Token::new(
                        TokenKind::Operator,
                        format!("{}=", c),
                        pos,
                    ));
                } else {
                    tokens.push(Token::new(TokenKind::Operator, c.to_string(), pos));
                }
            }
            '-' | '0'..='9' => {
                let mut text = String::new();
                if c == '-' {
                    text.push(c);
                    chars.next();
                    if !matches!(chars.peek(), Some(&(_, '0'..='9'))) {
                        return Err(unexpected(pos, '-'));
                    }
                }
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Fractional part only when a digit follows the dot;
                // otherwise the dot is an expression separator.
                if matches!(chars.peek(), Some(&(_, '.'))) {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    if matches!(lookahead.peek(), Some(&(_, '0'..='9'))) {
                        text.push('.');
                        chars.next();
                        while let Some(&(_, d)) = chars.peek() {
                            if d.is_ascii_digit() {
                                text.push(d);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                }
                tokens.push(Token::new(TokenKind::Number, text, pos));
            }
            c if is_keyword_char(c) => {
                let mut text = String::new();
                while let Some(&(_, k)) = chars.peek() {
                    if is_keyword_char(k) {
                        text.push(k);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::new(TokenKind::Keyword, text, pos));
            }
            other => {
                return Err(unexpected(pos, other));
            }
        }
    }

    Ok(tokens)
}

fn unexpected(pos: usize, c: char) -> OsmGridError {
    OsmGridError::Parse {
        position: pos,
        expected: "a valid token".to_string(),
        found: format!("'{}'", c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_statement_tokens() {
        let tokens = tokenize("bbox(0,0,0.2,0.1).nodes{a=1}").unwrap();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["bbox", "(", "0", "0", "0.2", "0.1", ")", ".", "nodes", "{", "a", "=", "1", "}"]
        );
        assert_eq!(tokens[0].kind, TokenKind::Keyword);
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[7].kind, TokenKind::Dot);
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize("= != < <= > >= !").unwrap();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["=", "!=", "<", "<=", ">", ">=", "!"]);
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Operator));
    }

    #[test]
    fn test_keyword_charset_includes_colon_and_at() {
        let tokens = tokenize("addr:housenumber @osm_id").unwrap();
        assert_eq!(tokens[0].text, "addr:housenumber");
        assert_eq!(tokens[1].text, "@osm_id");
    }

    #[test]
    fn test_comment_runs_to_end_of_line() {
        let tokens = tokenize("a // comment = junk\n= b").unwrap();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "=", "b"]);
    }

    #[test]
    fn test_negative_and_fractional_numbers() {
        let tokens = tokenize("-1.5 7 0.25").unwrap();
        assert_eq!(tokens[0].text, "-1.5");
        assert_eq!(tokens[1].text, "7");
        assert_eq!(tokens[2].text, "0.25");
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Number));
    }

    #[test]
    fn test_dot_after_number_stays_separator() {
        assert_eq!(
            kinds("1.nodes"),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Keyword]
        );
    }

    #[test]
    fn test_wildcard_token() {
        assert_eq!(kinds("a=*"), vec![TokenKind::Keyword, TokenKind::Operator, TokenKind::Wildcard]);
    }

    #[test]
    fn test_unknown_character_reports_byte_position() {
        let err = tokenize("abc #").unwrap_err();
        match err {
            OsmGridError::Parse { position, found, .. } => {
                assert_eq!(position, 4);
                assert_eq!(found, "'#'");
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
