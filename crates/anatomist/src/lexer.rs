//! Tokenizer for boolean Structured Text expressions.
//!
//! Keywords (`AND`, `OR`, `NOT`, `TRUE`, `FALSE`) are case-insensitive.
//! Identifiers keep their original spelling and are compared case-sensitively
//! by every downstream consumer.

use crate::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    And,
    Or,
    Not,
    True,
    False,
    LParen,
    RParen,
}

impl TokenKind {
    /// Source-like rendering used in error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier `{name}`"),
            TokenKind::And => "`AND`".into(),
            TokenKind::Or => "`OR`".into(),
            TokenKind::Not => "`NOT`".into(),
            TokenKind::True => "`TRUE`".into(),
            TokenKind::False => "`FALSE`".into(),
            TokenKind::LParen => "`(`".into(),
            TokenKind::RParen => "`)`".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character in the input.
    pub offset: usize,
}

impl Token {
    /// Byte offset one past the last character.
    pub fn end(&self) -> usize {
        self.offset
            + match &self.kind {
                TokenKind::Ident(name) => name.len(),
                TokenKind::And | TokenKind::Not => 3,
                TokenKind::Or => 2,
                TokenKind::True => 4,
                TokenKind::False => 5,
                TokenKind::LParen | TokenKind::RParen => 1,
            }
    }

    /// Returns the identifier name if this token is one.
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Splits `text` into tokens.
///
/// # Errors
/// `ParseError::UnexpectedCharacter` for anything outside the grammar's alphabet.
pub fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        match c {
            '(' => {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::LParen,
                    offset,
                });
            }
            ')' => {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::RParen,
                    offset,
                });
            }
            c if is_ident_start(c) => {
                let mut end = offset;
                while let Some(&(i, c)) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let word = &text[offset..end];
                let kind = if word.eq_ignore_ascii_case("AND") {
                    TokenKind::And
                } else if word.eq_ignore_ascii_case("OR") {
                    TokenKind::Or
                } else if word.eq_ignore_ascii_case("NOT") {
                    TokenKind::Not
                } else if word.eq_ignore_ascii_case("TRUE") {
                    TokenKind::True
                } else if word.eq_ignore_ascii_case("FALSE") {
                    TokenKind::False
                } else {
                    TokenKind::Ident(word.to_string())
                };
                tokens.push(Token { kind, offset });
            }
            other => {
                return Err(ParseError::UnexpectedCharacter {
                    found: other,
                    offset,
                })
            }
        }
    }

    Ok(tokens)
}
