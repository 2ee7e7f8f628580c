//! # The Warden: Static Safety Rule Checker
//!
//! Applies the safety policy directly to an extracted expression, fail-fast:
//!
//! 1. **Absence**: nothing extracted.
//! 2. **Constant**: the text is a bare boolean literal.
//! 3. **Syntax**: the text does not parse, or parses to a constant.
//! 4. **Rules**: [`rules::RULES`] in order (presence, polarity, disjunction
//!    bypass, forbidden combinations).
//!
//! The checker is a conservative syntactic approximation. It may reject
//! logic that is semantically safe; the exhaustive proof in `oracle` runs
//! after it, never instead of it.

pub mod rules;

use std::ops::Range;

use anatomist::expr::parse;
use anatomist::extract::is_bare_constant;
use anatomist::lexer::{tokenize, Token, TokenKind};
use anatomist::Expr;
use common::rules::RuleConfig;
use common::{RiskLevel, ValidationResult, ViolationKind};
use tracing::debug;

pub use rules::{PolicyRule, RULES};

/// Reason attached to a passing verdict.
pub const SAFE_REASON: &str = "Valid safety logic: all static safety rules satisfied";

/// A parsed expression as seen by the policy rules.
pub struct Subject<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    expr: Expr,
    branches: Vec<Range<usize>>,
}

impl<'a> Subject<'a> {
    /// Tokenizes and parses `text`.
    pub fn new(text: &'a str) -> Result<Self, anatomist::ParseError> {
        let expr = parse(text)?;
        let tokens = tokenize(text)?;
        let branches = top_level_branches(&tokens);
        Ok(Self {
            text,
            tokens,
            expr,
            branches,
        })
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Token index ranges of the top-level `OR` branches.
    pub fn branches(&self) -> &[Range<usize>] {
        &self.branches
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Source text of one branch.
    pub fn branch_text(&self, branch: &Range<usize>) -> &'a str {
        match (self.tokens.get(branch.start), branch.end.checked_sub(1)) {
            (Some(first), Some(last_idx)) => match self.tokens.get(last_idx) {
                Some(last) => self.text[first.offset..last.end()].trim(),
                None => "",
            },
            _ => "",
        }
    }

    pub fn has_token(&self, name: &str) -> bool {
        self.has_token_in(&(0..self.tokens.len()), name)
    }

    pub fn has_token_in(&self, range: &Range<usize>, name: &str) -> bool {
        self.tokens[range.clone()]
            .iter()
            .any(|t| t.ident() == Some(name))
    }

    /// `NOT <name>` appears as adjacent tokens.
    pub fn has_negated(&self, name: &str) -> bool {
        self.tokens
            .windows(2)
            .any(|w| w[0].kind == TokenKind::Not && w[1].ident() == Some(name))
    }

    /// Some occurrence of `name` in `range` is not immediately preceded by `NOT`.
    pub fn has_unnegated_in(&self, range: &Range<usize>, name: &str) -> bool {
        range.clone().any(|i| {
            self.tokens[i].ident() == Some(name)
                && (i == 0 || self.tokens[i - 1].kind != TokenKind::Not)
        })
    }
}

/// Splits the token stream on `OR` tokens at parenthesis depth zero.
fn top_level_branches(tokens: &[Token]) -> Vec<Range<usize>> {
    let mut branches = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Or if depth == 0 => {
                branches.push(start..i);
                start = i + 1;
            }
            _ => {}
        }
    }
    branches.push(start..tokens.len());
    branches
}

/// Runs the static checks against an extracted expression.
///
/// `None` means nothing was extracted, which is itself a critical violation.
pub fn check(expr_text: Option<&str>, config: &RuleConfig) -> ValidationResult {
    let Some(text) = expr_text else {
        debug!(stage = "absence", "no expression extracted");
        return ValidationResult::violation(
            ViolationKind::ExtractionFailure,
            RiskLevel::Critical,
            "No output assignment detected",
        );
    };

    if is_bare_constant(text) {
        debug!(stage = "constant", expression = text, "bare constant");
        return constant_violation();
    }

    let subject = match Subject::new(text) {
        Ok(subject) => subject,
        Err(e) => {
            debug!(stage = "syntax", expression = text, error = %e, "parse failed");
            return ValidationResult::violation(
                ViolationKind::SyntaxError,
                RiskLevel::Critical,
                format!("Malformed boolean expression: {e}"),
            );
        }
    };

    if subject.expr().is_constant() {
        debug!(stage = "constant", expression = text, "no free variables");
        return constant_violation();
    }

    check_subject(&subject, config)
}

/// Runs [`RULES`] against an already-parsed subject.
pub fn check_subject(subject: &Subject<'_>, config: &RuleConfig) -> ValidationResult {
    for rule in RULES {
        if let Some(verdict) = rule.apply(subject, config) {
            debug!(stage = rule.name(), reason = %verdict.reason, "rule rejected expression");
            return verdict;
        }
    }
    ValidationResult::safe(SAFE_REASON)
}

fn constant_violation() -> ValidationResult {
    ValidationResult::violation(
        ViolationKind::ConstantExpression,
        RiskLevel::Critical,
        "Unsafe constant expression: output always energized/de-energized regardless of input",
    )
}
