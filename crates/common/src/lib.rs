//! # Common: Verdict Vocabulary & Shared Policy Types
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! - [`Status`] / [`RiskLevel`]: the two axes of a verdict.
//! - [`ViolationKind`]: which rule produced a violation.
//! - [`ValidationResult`]: the structured result of one check.
//! - [`rules::RuleConfig`]: the immutable safety policy.
//! - [`ledger`]: the on-disk audit trail of hardening runs.

pub mod ledger;
pub mod rules;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A concrete input assignment witnessing an unsafe state, ordered by signal name.
pub type Counterexample = BTreeMap<String, bool>;

/// Outcome of a single validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum Status {
    Safe = 0,
    Violation = 1,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Safe => "SAFE",
            Status::Violation => "VIOLATION",
        }
    }

    /// Decodes the `u8` representation stored in the ledger.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Status::Safe),
            1 => Some(Status::Violation),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Severity attached to a verdict. Ordered: `Low < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum RiskLevel {
    Low = 0,
    High = 1,
    Critical = 2,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RiskLevel::Low),
            1 => Some(RiskLevel::High),
            2 => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// The rule (or failure mode) responsible for a `VIOLATION` verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    /// No output assignment could be extracted (includes generator failures).
    ExtractionFailure,
    /// The expression text is not a well-formed boolean expression.
    SyntaxError,
    /// The output does not depend on any input.
    ConstantExpression,
    /// A mandatory interlock signal never appears.
    MissingMandatorySignal,
    /// A mandatory interlock enables the output instead of cutting it.
    PolarityViolation,
    /// A top-level `OR` branch bypasses the interlock.
    DisjunctionBypass,
    /// A configured forbidden signal pair appears unguarded.
    ForbiddenCombination,
    /// The exhaustive search found an unsafe input assignment.
    Counterexample,
    /// Too many free variables for exhaustive enumeration.
    StateSpaceTooLarge,
    /// The hardening controller ran out of attempts.
    RetriesExhausted,
}

/// Structured result of one safety check. Pure value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: Status,
    pub risk_level: RiskLevel,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ViolationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterexample: Option<Counterexample>,
}

impl ValidationResult {
    /// A passing verdict (`SAFE/LOW`).
    pub fn safe(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Safe,
            risk_level: RiskLevel::Low,
            reason: reason.into(),
            kind: None,
            counterexample: None,
        }
    }

    /// A failing verdict at the given severity.
    pub fn violation(kind: ViolationKind, risk_level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Violation,
            risk_level,
            reason: reason.into(),
            kind: Some(kind),
            counterexample: None,
        }
    }

    /// Attaches a witnessing assignment.
    pub fn with_counterexample(mut self, counterexample: Counterexample) -> Self {
        self.counterexample = Some(counterexample);
        self
    }

    pub fn is_safe(&self) -> bool {
        self.status == Status::Safe
    }
}

/// Renders a counterexample as `A=TRUE, B=FALSE` in name order.
pub fn format_counterexample(counterexample: &Counterexample) -> String {
    counterexample
        .iter()
        .map(|(name, value)| format!("{}={}", name, if *value { "TRUE" } else { "FALSE" }))
        .collect::<Vec<_>>()
        .join(", ")
}
