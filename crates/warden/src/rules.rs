//! Policy rules applied to a parsed expression.
//!
//! Rules run in a fixed order and the first one to return a verdict wins.
//! The order is most-severe-first: presence, polarity, disjunction bypass,
//! forbidden combinations.

use crate::Subject;
use common::rules::RuleConfig;
use common::{RiskLevel, ValidationResult, ViolationKind};

/// A structural safety rule.
///
/// # Implementation Notes
/// - Rules see the token stream and the top-level `OR` branches, never raw text.
/// - Rules are pure: same subject and config, same answer.
/// - Returning `None` means "no objection"; the next rule runs.
pub trait PolicyRule: Sync {
    /// Short stage name for tracing.
    fn name(&self) -> &'static str;

    fn apply(&self, subject: &Subject<'_>, config: &RuleConfig) -> Option<ValidationResult>;
}

/// Evaluation order.
pub static RULES: &[&dyn PolicyRule] = &[
    &MandatoryPresence,
    &Polarity,
    &DisjunctionBypass,
    &ForbiddenCombination,
];

/// Every mandatory signal must appear as a token.
pub struct MandatoryPresence;

impl PolicyRule for MandatoryPresence {
    fn name(&self) -> &'static str {
        "mandatory_presence"
    }

    fn apply(&self, subject: &Subject<'_>, config: &RuleConfig) -> Option<ValidationResult> {
        let missing = config
            .mandatory_signals()
            .iter()
            .find(|signal| !subject.has_token(signal))?;
        Some(ValidationResult::violation(
            ViolationKind::MissingMandatorySignal,
            RiskLevel::Critical,
            format!("Mandatory safety signal {missing} missing from the output expression"),
        ))
    }
}

/// Every mandatory signal must appear as `NOT <signal>` at least once.
///
/// Multi-branch disjunctions are left to [`DisjunctionBypass`], which reports
/// the same defect per branch.
pub struct Polarity;

impl PolicyRule for Polarity {
    fn name(&self) -> &'static str {
        "polarity"
    }

    fn apply(&self, subject: &Subject<'_>, config: &RuleConfig) -> Option<ValidationResult> {
        if subject.branch_count() > 1 {
            return None;
        }
        let signal = config
            .mandatory_signals()
            .iter()
            .find(|signal| !subject.has_negated(signal))?;
        Some(ValidationResult::violation(
            ViolationKind::PolarityViolation,
            RiskLevel::Critical,
            format!(
                "Incorrect polarity: {signal} is not negated, so the emergency stop enables \
                 the output instead of cutting it"
            ),
        ))
    }
}

/// Top-level `OR` branches must each carry every mandatory signal, negated.
///
/// Parenthesized sub-expressions are opaque here; a nested `OR` is left to
/// the exhaustive proof.
pub struct DisjunctionBypass;

impl PolicyRule for DisjunctionBypass {
    fn name(&self) -> &'static str {
        "disjunction_bypass"
    }

    fn apply(&self, subject: &Subject<'_>, config: &RuleConfig) -> Option<ValidationResult> {
        if subject.branch_count() < 2 {
            return None;
        }

        for signal in config.mandatory_signals() {
            for branch in subject.branches() {
                if subject.has_unnegated_in(branch, signal) {
                    return Some(ValidationResult::violation(
                        ViolationKind::DisjunctionBypass,
                        RiskLevel::Critical,
                        format!(
                            "Disjunction bypass: OR branch `{}` uses {signal} without NOT, \
                             so the emergency stop energizes the output on that path",
                            subject.branch_text(branch)
                        ),
                    ));
                }
            }
        }

        for signal in config.mandatory_signals() {
            for branch in subject.branches() {
                if !subject.has_token_in(branch, signal) {
                    return Some(ValidationResult::violation(
                        ViolationKind::DisjunctionBypass,
                        RiskLevel::High,
                        format!(
                            "Disjunction bypass: OR branch `{}` omits {signal}, creating an \
                             activation path around the interlock",
                            subject.branch_text(branch)
                        ),
                    ));
                }
            }
        }

        None
    }
}

/// Configured signal pairs must not both appear with the active signal unguarded.
pub struct ForbiddenCombination;

impl PolicyRule for ForbiddenCombination {
    fn name(&self) -> &'static str {
        "forbidden_combination"
    }

    fn apply(&self, subject: &Subject<'_>, config: &RuleConfig) -> Option<ValidationResult> {
        let rule = config.forbidden_combinations().iter().find(|rule| {
            subject.has_token(&rule.active_signal)
                && subject.has_token(&rule.forbidden_with)
                && !subject.has_negated(&rule.active_signal)
        })?;
        Some(ValidationResult::violation(
            ViolationKind::ForbiddenCombination,
            rule.risk_level,
            format!(
                "Forbidden combination {} ({}): {} active together with {}. Consequence: {}",
                rule.id, rule.name, rule.active_signal, rule.forbidden_with, rule.consequence
            ),
        ))
    }
}
