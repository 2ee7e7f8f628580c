//! # The Forge: Hardening Controller
//!
//! Drives a [`Generator`] toward logic that passes verification.
//!
//! ## State Machine
//! `GENERATING → VALIDATING → {DONE_SAFE | RETRY | DONE_CRITICAL}`
//!
//! - At most [`MAX_ATTEMPTS`] attempts. Every attempt is recorded before the
//!   next transition, whatever its outcome.
//! - A rejected attempt feeds its reason, expression and counterexample back
//!   into the next generation request.
//! - Running out of attempts ends in [`FinalStatus::CriticalViolation`]. There
//!   is no other way out: the controller fails closed.
//! - A generator error or timeout is an attempt with no code, judged as a
//!   critical extraction failure.

pub mod evaluate;

use anatomist::{extract, Assignment};
use common::ledger::{AttemptRecord, LedgerEntry, FINAL_CRITICAL, FINAL_SAFE};
use common::rules::RuleConfig;
use common::{format_counterexample, RiskLevel, ValidationResult, ViolationKind};
use lazarus::Generator;
use oracle::{verify, ProofMode};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Hard bound on generation attempts per run.
pub const MAX_ATTEMPTS: usize = 3;

/// Default per-attempt generation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Explanation attached to every run that exhausts its attempts.
pub fn failure_explanation() -> String {
    format!(
        "Unable to generate safe verifiable logic after {MAX_ATTEMPTS} attempts; \
         human review required."
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardeningConfig {
    /// Per-attempt generation timeout.
    pub timeout: Duration,
    /// Attach a rationale to successful runs.
    pub explain: bool,
    pub mode: ProofMode,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            explain: false,
            mode: ProofMode::Exhaustive,
        }
    }
}

/// One generate-and-validate cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardeningAttempt {
    pub attempt: u32,
    /// Generator output verbatim; empty when generation failed.
    pub raw_code: String,
    pub assignment: Option<Assignment>,
    pub result: ValidationResult,
}

impl HardeningAttempt {
    fn to_record(&self) -> AttemptRecord {
        AttemptRecord {
            attempt: self.attempt,
            raw_code: self.raw_code.clone(),
            output_variable: self.assignment.as_ref().map(|a| a.output_variable.clone()),
            expression: self.assignment.as_ref().map(|a| a.expression_text.clone()),
            status: self.result.status as u8,
            risk_level: self.result.risk_level as u8,
            reason: self.result.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinalStatus {
    #[serde(rename = "SAFE")]
    Safe,
    #[serde(rename = "CRITICAL VIOLATION")]
    CriticalViolation,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalStatus::Safe => f.write_str("SAFE"),
            FinalStatus::CriticalViolation => f.write_str("CRITICAL VIOLATION"),
        }
    }
}

/// Complete record of a hardening run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardeningRun {
    iterations: Vec<HardeningAttempt>,
    final_status: FinalStatus,
    explanation: Option<String>,
}

impl HardeningRun {
    pub fn iterations(&self) -> &[HardeningAttempt] {
        &self.iterations
    }

    pub fn final_status(&self) -> FinalStatus {
        self.final_status
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn is_safe(&self) -> bool {
        self.final_status == FinalStatus::Safe
    }

    /// The run's overall verdict: the accepted attempt's result, or a
    /// critical `RetriesExhausted` violation.
    pub fn verdict(&self) -> ValidationResult {
        match (self.final_status, self.iterations.last()) {
            (FinalStatus::Safe, Some(last)) => last.result.clone(),
            _ => ValidationResult::violation(
                ViolationKind::RetriesExhausted,
                RiskLevel::Critical,
                failure_explanation(),
            ),
        }
    }

    /// Converts the run into an archivable ledger entry.
    pub fn to_ledger_entry(&self, description: &str, rules: &RuleConfig) -> LedgerEntry {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        LedgerEntry {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            description: description.to_string(),
            rules_fingerprint: rules.fingerprint(),
            final_status: if self.is_safe() { FINAL_SAFE } else { FINAL_CRITICAL },
            explanation: self.explanation.clone(),
            attempts: self.iterations.iter().map(HardeningAttempt::to_record).collect(),
        }
    }
}

/// Bounded generate-validate-retry loop over one generator and one policy.
pub struct HardeningController {
    generator: Arc<dyn Generator>,
    rules: Arc<RuleConfig>,
    config: HardeningConfig,
}

impl HardeningController {
    pub fn new(
        generator: Arc<dyn Generator>,
        rules: Arc<RuleConfig>,
        config: HardeningConfig,
    ) -> Self {
        Self {
            generator,
            rules,
            config,
        }
    }

    pub fn config(&self) -> &HardeningConfig {
        &self.config
    }

    /// Runs the loop for `description`. Always terminates within
    /// [`MAX_ATTEMPTS`] generator calls.
    pub async fn harden(&self, description: &str) -> HardeningRun {
        let mut iterations: Vec<HardeningAttempt> = Vec::with_capacity(MAX_ATTEMPTS);
        let mut feedback: Option<String> = None;

        for attempt in 1..=MAX_ATTEMPTS as u32 {
            info!(attempt, state = "GENERATING", "requesting logic");
            let current = self.attempt(attempt, description, feedback.as_deref()).await;
            let safe = current.result.is_safe();
            info!(
                attempt,
                state = "VALIDATING",
                status = %current.result.status,
                risk = %current.result.risk_level,
                "attempt judged"
            );

            feedback = Some(rejection_feedback(&current));
            iterations.push(current);

            if safe {
                let explanation = if self.config.explain {
                    iterations.last().map(success_explanation)
                } else {
                    None
                };
                info!(attempts = attempt, state = "DONE_SAFE", "hardening succeeded");
                return HardeningRun {
                    iterations,
                    final_status: FinalStatus::Safe,
                    explanation,
                };
            }

            if (attempt as usize) < MAX_ATTEMPTS {
                info!(attempt, state = "RETRY", "regenerating with feedback");
            }
        }

        warn!(attempts = MAX_ATTEMPTS, state = "DONE_CRITICAL", "hardening exhausted");
        HardeningRun {
            iterations,
            final_status: FinalStatus::CriticalViolation,
            explanation: Some(failure_explanation()),
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        description: &str,
        feedback: Option<&str>,
    ) -> HardeningAttempt {
        let generated = tokio::time::timeout(
            self.config.timeout,
            self.generator.generate(description, feedback),
        )
        .await;

        let failure = match generated {
            Ok(Ok(raw_code)) => {
                let assignment = extract(&raw_code);
                let result = verify(assignment.as_ref(), &self.rules, self.config.mode);
                return HardeningAttempt {
                    attempt,
                    raw_code,
                    assignment,
                    result,
                };
            }
            Ok(Err(e)) => format!("Generation failed: {e}"),
            Err(_) => format!(
                "Generation timed out after {:.1}s",
                self.config.timeout.as_secs_f64()
            ),
        };

        warn!(attempt, reason = %failure, "generation unavailable");
        HardeningAttempt {
            attempt,
            raw_code: String::new(),
            assignment: None,
            result: ValidationResult::violation(
                ViolationKind::ExtractionFailure,
                RiskLevel::Critical,
                failure,
            ),
        }
    }
}

/// Message handed to the generator after a rejected attempt.
fn rejection_feedback(attempt: &HardeningAttempt) -> String {
    let mut text = format!(
        "Attempt {} was rejected ({} {}): {}",
        attempt.attempt, attempt.result.status, attempt.result.risk_level, attempt.result.reason
    );
    if let Some(assignment) = &attempt.assignment {
        text.push_str(&format!(
            "\nOffending expression: {} := {}",
            assignment.output_variable, assignment.expression_text
        ));
    }
    if let Some(counterexample) = &attempt.result.counterexample {
        text.push_str(&format!(
            "\nCounterexample: {}",
            format_counterexample(counterexample)
        ));
    }
    text
}

fn success_explanation(attempt: &HardeningAttempt) -> String {
    let (output, expression) = attempt
        .assignment
        .as_ref()
        .map(|a| (a.output_variable.as_str(), a.expression_text.as_str()))
        .unwrap_or(("-", "-"));
    format!(
        "Output Variable: {output}\nBoolean Expression: {expression}\nSafety Check: {}\nFinal Status: SAFE",
        attempt.result.reason
    )
}
