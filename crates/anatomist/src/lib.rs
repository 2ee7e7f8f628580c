//! # The Anatomist: Control-Logic Dissection
//!
//! **Role**: Turns untrusted control-logic text into typed facts.
//!
//! **Core Types**:
//! - [`Assignment`]: the safety-relevant output and its raw expression text.
//! - [`Expr`]: boolean AST over variables, `NOT`, `AND`, `OR` and constants.
//! - [`lexer::Token`]: positioned tokens, shared with the static checker.
//!
//! **Design**:
//! - Extraction is a pure scan: identical text always yields the identical assignment.
//! - Parsing is an explicit tokenizer + recursive-descent parser; errors carry byte offsets.
//! - Evaluation walks the typed tree. No text is ever executed.

pub mod expr;
pub mod extract;
pub mod lexer;

pub use expr::{parse, Expr, MAX_EXPRESSION_TOKENS, MAX_NESTING_DEPTH};
pub use extract::{extract, Assignment};

/// Malformed boolean expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character `{found}` at offset {offset}")]
    UnexpectedCharacter { found: char, offset: usize },

    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        offset: usize,
    },

    #[error("expression ends at offset {offset}, expected {expected}")]
    UnexpectedEnd { expected: &'static str, offset: usize },

    #[error("unbalanced parenthesis at offset {offset}")]
    UnbalancedParen { offset: usize },

    #[error("nesting deeper than {limit} levels at offset {offset}")]
    TooDeep { limit: usize, offset: usize },

    #[error("expression has {tokens} tokens, more than the limit of {limit} (token at offset {offset})")]
    TooLong {
        tokens: usize,
        limit: usize,
        offset: usize,
    },
}

impl ParseError {
    /// Byte offset of the offending input, when one exists.
    pub fn offset(&self) -> Option<usize> {
        match self {
            ParseError::Empty => None,
            ParseError::UnexpectedCharacter { offset, .. }
            | ParseError::UnexpectedToken { offset, .. }
            | ParseError::UnexpectedEnd { offset, .. }
            | ParseError::UnbalancedParen { offset }
            | ParseError::TooDeep { offset, .. }
            | ParseError::TooLong { offset, .. } => Some(*offset),
        }
    }
}

/// Evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("unbound variable `{0}`")]
    UnboundVariable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_then_parse() {
        let assignment = extract("MotorRun := StartButton AND NOT EmergencyStopButton;").unwrap();
        let expr = parse(&assignment.expression_text).unwrap();
        let vars: Vec<_> = expr.free_variables().into_iter().collect();
        assert_eq!(vars, vec!["EmergencyStopButton", "StartButton"]);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ParseError::Empty.to_string(), "empty expression");
        let err = parse("A AND (B").unwrap_err();
        assert_eq!(err.to_string(), "unbalanced parenthesis at offset 6");
        assert_eq!(err.offset(), Some(6));
        assert_eq!(ParseError::Empty.offset(), None);
    }
}
