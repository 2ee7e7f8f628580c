//! Boolean expression model: AST, recursive-descent parser and evaluator.
//!
//! Grammar (precedence `NOT > AND > OR`, binary operators left-associative):
//!
//! ```text
//! or_expr  := and_expr ( OR and_expr )*
//! and_expr := unary ( AND unary )*
//! unary    := NOT unary | primary
//! primary  := IDENT | TRUE | FALSE | '(' or_expr ')'
//! ```
//!
//! Model-supplied text is only ever turned into this typed tree; nothing is
//! executed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::lexer::{tokenize, Token, TokenKind};
use crate::{EvalError, ParseError};

/// Maximum nesting of parentheses / `NOT` chains accepted from untrusted input.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Maximum token count of one expression. Binary chains are not bounded by
/// the nesting limit, and every tree walk (including `Drop`) recurses.
pub const MAX_EXPRESSION_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Variable(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Const(bool),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Expr::And(Box::new(lhs), Box::new(rhs))
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Expr::Or(Box::new(lhs), Box::new(rhs))
    }

    /// Evaluates under a total assignment.
    ///
    /// Both operands of every binary node are evaluated, so an unbound
    /// variable anywhere in the tree is always reported.
    ///
    /// # Errors
    /// `EvalError::UnboundVariable` if the tree references a name missing from `env`.
    pub fn evaluate(&self, env: &BTreeMap<String, bool>) -> Result<bool, EvalError> {
        match self {
            Expr::Variable(name) => env
                .get(name)
                .copied()
                .ok_or_else(|| EvalError::UnboundVariable(name.clone())),
            Expr::Const(value) => Ok(*value),
            Expr::Not(inner) => Ok(!inner.evaluate(env)?),
            Expr::And(lhs, rhs) => {
                let l = lhs.evaluate(env)?;
                let r = rhs.evaluate(env)?;
                Ok(l & r)
            }
            Expr::Or(lhs, rhs) => {
                let l = lhs.evaluate(env)?;
                let r = rhs.evaluate(env)?;
                Ok(l | r)
            }
        }
    }

    /// All identifiers referenced by the tree.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Variable(name) => {
                out.insert(name.clone());
            }
            Expr::Const(_) => {}
            Expr::Not(inner) => inner.collect_variables(out),
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
        }
    }

    /// `true` when the expression does not depend on any input.
    pub fn is_constant(&self) -> bool {
        self.free_variables().is_empty()
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(..) => 1,
            Expr::And(..) => 2,
            Expr::Not(_) => 3,
            Expr::Variable(_) | Expr::Const(_) => 4,
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        let wrap = self.precedence() < min;
        if wrap {
            f.write_str("(")?;
        }
        match self {
            Expr::Variable(name) => f.write_str(name)?,
            Expr::Const(true) => f.write_str("TRUE")?,
            Expr::Const(false) => f.write_str("FALSE")?,
            Expr::Not(inner) => {
                f.write_str("NOT ")?;
                inner.fmt_prec(f, 3)?;
            }
            Expr::And(lhs, rhs) => {
                lhs.fmt_prec(f, 2)?;
                f.write_str(" AND ")?;
                rhs.fmt_prec(f, 3)?;
            }
            Expr::Or(lhs, rhs) => {
                lhs.fmt_prec(f, 1)?;
                f.write_str(" OR ")?;
                rhs.fmt_prec(f, 2)?;
            }
        }
        if wrap {
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Canonical upper-case Structured Text with minimal parentheses.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, 0)
    }
}

/// Parses expression text into an [`Expr`].
///
/// # Errors
/// Empty input, unbalanced parentheses, stray tokens, characters outside the
/// grammar, nesting deeper than [`MAX_NESTING_DEPTH`], or more than
/// [`MAX_EXPRESSION_TOKENS`] tokens.
pub fn parse(text: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }
    if let Some(tok) = tokens.get(MAX_EXPRESSION_TOKENS) {
        return Err(ParseError::TooLong {
            tokens: tokens.len(),
            limit: MAX_EXPRESSION_TOKENS,
            offset: tok.offset,
        });
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        end: text.len(),
    };
    let expr = parser.or_expr()?;

    if let Some(tok) = parser.peek() {
        return Err(match tok.kind {
            TokenKind::RParen => ParseError::UnbalancedParen { offset: tok.offset },
            _ => ParseError::UnexpectedToken {
                found: tok.kind.describe(),
                expected: "`AND`, `OR` or end of expression",
                offset: tok.offset,
            },
        });
    }
    Ok(expr)
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    depth: usize,
    end: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn next_if(&mut self, kind: &TokenKind) -> bool {
        match self.peek() {
            Some(tok) if &tok.kind == kind => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn enter(&mut self, offset: usize) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::TooDeep {
                limit: MAX_NESTING_DEPTH,
                offset,
            });
        }
        Ok(())
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.next_if(&TokenKind::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::or(lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while self.next_if(&TokenKind::And) {
            let rhs = self.unary()?;
            lhs = Expr::and(lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(tok) if tok.kind == TokenKind::Not => {
                self.pos += 1;
                self.enter(tok.offset)?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(Expr::not(inner))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let Some(tok) = self.peek() else {
            return Err(ParseError::UnexpectedEnd {
                expected: "an operand",
                offset: self.end,
            });
        };
        self.pos += 1;

        match &tok.kind {
            TokenKind::Ident(name) => Ok(Expr::Variable(name.clone())),
            TokenKind::True => Ok(Expr::Const(true)),
            TokenKind::False => Ok(Expr::Const(false)),
            TokenKind::LParen => {
                self.enter(tok.offset)?;
                let inner = self.or_expr()?;
                self.depth -= 1;
                if !self.next_if(&TokenKind::RParen) {
                    return Err(ParseError::UnbalancedParen { offset: tok.offset });
                }
                Ok(inner)
            }
            TokenKind::RParen => Err(ParseError::UnbalancedParen { offset: tok.offset }),
            other => Err(ParseError::UnexpectedToken {
                found: other.describe(),
                expected: "an operand",
                offset: tok.offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_precedence_not_and_or() {
        // NOT binds tighter than AND, AND tighter than OR.
        let expr = parse("A OR NOT B AND C").unwrap();
        assert_eq!(
            expr,
            Expr::or(Expr::var("A"), Expr::and(Expr::not(Expr::var("B")), Expr::var("C")))
        );
    }

    #[test]
    fn test_parentheses_override() {
        let expr = parse("(A OR B) AND NOT C").unwrap();
        assert_eq!(
            expr,
            Expr::and(Expr::or(Expr::var("A"), Expr::var("B")), Expr::not(Expr::var("C")))
        );
    }

    #[test]
    fn test_left_associative() {
        let expr = parse("A AND B AND C").unwrap();
        assert_eq!(
            expr,
            Expr::and(Expr::and(Expr::var("A"), Expr::var("B")), Expr::var("C"))
        );
    }

    #[test]
    fn test_constants_lowercase() {
        assert_eq!(parse("true").unwrap(), Expr::Const(true));
        assert_eq!(parse("not false").unwrap(), Expr::not(Expr::Const(false)));
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(parse(""), Err(ParseError::Empty));
        assert_eq!(parse("   \n\t"), Err(ParseError::Empty));
    }

    #[test]
    fn test_rejects_unbalanced() {
        assert_eq!(parse("(A AND B"), Err(ParseError::UnbalancedParen { offset: 0 }));
        assert_eq!(parse("A AND B)"), Err(ParseError::UnbalancedParen { offset: 7 }));
        assert_eq!(parse(")"), Err(ParseError::UnbalancedParen { offset: 0 }));
    }

    #[test]
    fn test_rejects_dangling_operator() {
        assert!(matches!(parse("A AND"), Err(ParseError::UnexpectedEnd { offset: 5, .. })));
        assert!(matches!(
            parse("AND A"),
            Err(ParseError::UnexpectedToken { offset: 0, .. })
        ));
        assert!(matches!(
            parse("A B"),
            Err(ParseError::UnexpectedToken { offset: 2, .. })
        ));
        assert!(matches!(parse("()"), Err(ParseError::UnbalancedParen { offset: 1 })));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}A{}", "(".repeat(300), ")".repeat(300));
        assert!(matches!(parse(&deep), Err(ParseError::TooDeep { .. })));

        let nots = format!("{}A", "NOT ".repeat(300));
        assert!(matches!(parse(&nots), Err(ParseError::TooDeep { .. })));

        let fine = format!("{}A{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(parse(&fine).unwrap(), Expr::var("A"));
    }

    #[test]
    fn test_token_limit() {
        // A AND A ... with n operands has 2n - 1 tokens.
        let chain = |n: usize| vec!["A"; n].join(" AND ");

        let at_limit = chain(MAX_EXPRESSION_TOKENS / 2);
        assert_eq!(tokenize(&at_limit).unwrap().len(), MAX_EXPRESSION_TOKENS - 1);
        assert!(parse(&at_limit).is_ok());

        let over = chain(MAX_EXPRESSION_TOKENS / 2 + 1);
        match parse(&over) {
            Err(ParseError::TooLong { tokens, limit, offset }) => {
                assert_eq!(tokens, MAX_EXPRESSION_TOKENS + 1);
                assert_eq!(limit, MAX_EXPRESSION_TOKENS);
                assert_eq!(offset, over.len() - 1);
            }
            other => panic!("expected token limit error, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluate_truth_table() {
        let expr = parse("StartButton AND NOT EmergencyStopButton").unwrap();
        let cases = [
            (false, false, false),
            (false, true, false),
            (true, false, true),
            (true, true, false),
        ];
        for (start, estop, expected) in cases {
            let e = env(&[("StartButton", start), ("EmergencyStopButton", estop)]);
            assert_eq!(expr.evaluate(&e).unwrap(), expected);
        }
    }

    #[test]
    fn test_evaluate_unbound() {
        let expr = parse("A OR B").unwrap();
        // B is unbound even though A alone decides the result.
        assert_eq!(
            expr.evaluate(&env(&[("A", true)])),
            Err(EvalError::UnboundVariable("B".into()))
        );
    }

    #[test]
    fn test_free_variables_sorted_and_deduplicated() {
        let expr = parse("Zeta AND (Alpha OR NOT Zeta) AND TRUE").unwrap();
        let vars: Vec<String> = expr.free_variables().into_iter().collect();
        assert_eq!(vars, vec!["Alpha".to_string(), "Zeta".to_string()]);
        assert!(!expr.is_constant());
        assert!(parse("TRUE OR FALSE").unwrap().is_constant());
    }

    #[test]
    fn test_display_reparses_to_same_tree() {
        for src in [
            "A OR NOT B AND C",
            "(A OR B) AND NOT (C AND D)",
            "A AND (B AND C)",
            "NOT NOT a or false",
            "A OR (B OR C)",
        ] {
            let expr = parse(src).unwrap();
            let rendered = expr.to_string();
            assert_eq!(parse(&rendered).unwrap(), expr, "{src} -> {rendered}");
        }
        assert_eq!(
            parse("(a or b) and not c").unwrap().to_string(),
            "(a OR b) AND NOT c"
        );
    }
}
