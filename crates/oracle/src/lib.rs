//! # The Oracle: Exhaustive Counterexample Search
//!
//! Proves an output expression safe by enumerating every assignment of its
//! inputs. "Safe" means no input combination energizes the output while an
//! unsafe predicate holds, not merely that no syntactic pattern matched.
//!
//! The state space is `2^n` in the number of distinct signals. Anything above
//! [`MAX_EXHAUSTIVE_VARIABLES`] is refused with
//! [`OracleError::StateSpaceTooLarge`]; [`verify`] treats that refusal as a
//! critical violation.

use anatomist::{parse, Assignment, EvalError, Expr};
use common::rules::RuleConfig;
use common::{format_counterexample, Counterexample, RiskLevel, ValidationResult, ViolationKind};
use std::collections::BTreeMap;
use tracing::debug;

/// Largest signal count the enumerator accepts (about one million assignments).
pub const MAX_EXHAUSTIVE_VARIABLES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("state space too large: {variables} signals exceed the exhaustive limit of {limit}")]
    StateSpaceTooLarge { variables: usize, limit: usize },
    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),
}

/// How far [`verify`] goes after the static rules pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProofMode {
    /// Static rules only.
    Static,
    /// Static rules, then the exhaustive proof.
    #[default]
    Exhaustive,
}

/// An unsafe condition derived from the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsafePredicate {
    pub expr: Expr,
    pub risk_level: RiskLevel,
    /// Human-readable name used in violation reasons.
    pub label: String,
}

/// Searches for an input assignment making both `expr` and `unsafe_predicate` true.
///
/// Signals are enumerated in name order, first signal as the most significant
/// bit, `false` before `true`. The first witness found is returned, so the
/// result is deterministic.
///
/// # Errors
/// `OracleError::StateSpaceTooLarge` when the two expressions together name
/// more than [`MAX_EXHAUSTIVE_VARIABLES`] signals.
pub fn find_counterexample(
    expr: &Expr,
    unsafe_predicate: &Expr,
) -> Result<Option<Counterexample>, OracleError> {
    let mut names = expr.free_variables();
    names.extend(unsafe_predicate.free_variables());
    let names: Vec<String> = names.into_iter().collect();
    let n = names.len();

    if n > MAX_EXHAUSTIVE_VARIABLES {
        return Err(OracleError::StateSpaceTooLarge {
            variables: n,
            limit: MAX_EXHAUSTIVE_VARIABLES,
        });
    }

    let mut env: BTreeMap<String, bool> = names.iter().map(|name| (name.clone(), false)).collect();

    for mask in 0u32..(1u32 << n) {
        for (i, name) in names.iter().enumerate() {
            let bit = (mask >> (n - 1 - i)) & 1 == 1;
            if let Some(slot) = env.get_mut(name) {
                *slot = bit;
            }
        }
        if expr.evaluate(&env)? && unsafe_predicate.evaluate(&env)? {
            return Ok(Some(env));
        }
    }

    Ok(None)
}

/// Derives the unsafe predicates for one output.
///
/// - Each mandatory signal `S` yields `S`: the output must never be energized
///   while the interlock is asserted.
/// - Each forbidden rule whose active signal is an input of `expr` yields
///   `active AND forbidden_with`.
///
/// Forbidden rules whose active signal is not an input are skipped, including
/// rules naming the output itself.
pub fn unsafe_predicates(config: &RuleConfig, expr: &Expr) -> Vec<UnsafePredicate> {
    let inputs = expr.free_variables();

    let mandatory = config.mandatory_signals().iter().map(|signal| UnsafePredicate {
        expr: Expr::var(signal.as_str()),
        risk_level: RiskLevel::Critical,
        label: format!("output energized while {signal} is asserted"),
    });

    let forbidden = config.forbidden_combinations().iter().filter_map(|rule| {
        if !inputs.contains(&rule.active_signal) {
            return None;
        }
        Some(UnsafePredicate {
            expr: Expr::and(
                Expr::var(rule.active_signal.as_str()),
                Expr::var(rule.forbidden_with.as_str()),
            ),
            risk_level: rule.risk_level,
            label: format!(
                "forbidden combination {} ({}): {} with {}. Consequence: {}",
                rule.id, rule.name, rule.active_signal, rule.forbidden_with, rule.consequence
            ),
        })
    });

    mandatory.chain(forbidden).collect()
}

/// Full verification of one extracted assignment.
///
/// Static rules run first. When they pass and `mode` is
/// [`ProofMode::Exhaustive`], every unsafe predicate is model-checked in
/// order and the first counterexample is reported.
pub fn verify(
    assignment: Option<&Assignment>,
    config: &RuleConfig,
    mode: ProofMode,
) -> ValidationResult {
    let verdict = warden::check(assignment.map(|a| a.expression_text.as_str()), config);
    let Some(assignment) = assignment else {
        return verdict;
    };
    if !verdict.is_safe() || mode == ProofMode::Static {
        return verdict;
    }

    let expr = match parse(&assignment.expression_text) {
        Ok(expr) => expr,
        Err(e) => {
            return ValidationResult::violation(
                ViolationKind::SyntaxError,
                RiskLevel::Critical,
                format!("Malformed boolean expression: {e}"),
            )
        }
    };

    let predicates = unsafe_predicates(config, &expr);
    for predicate in &predicates {
        debug!(
            output = %assignment.output_variable,
            predicate = %predicate.expr,
            "model checking"
        );
        match find_counterexample(&expr, &predicate.expr) {
            Ok(None) => {}
            Ok(Some(counterexample)) => {
                return ValidationResult::violation(
                    ViolationKind::Counterexample,
                    predicate.risk_level,
                    format!(
                        "Counterexample: {} is reachable ({}), {}",
                        assignment.output_variable,
                        format_counterexample(&counterexample),
                        predicate.label
                    ),
                )
                .with_counterexample(counterexample);
            }
            Err(e @ OracleError::StateSpaceTooLarge { .. }) => {
                return ValidationResult::violation(
                    ViolationKind::StateSpaceTooLarge,
                    RiskLevel::Critical,
                    format!("Cannot prove safety: {e}"),
                );
            }
            Err(e) => {
                return ValidationResult::violation(
                    ViolationKind::Counterexample,
                    RiskLevel::Critical,
                    format!("Cannot prove safety: {e}"),
                );
            }
        }
    }

    ValidationResult::safe(format!(
        "{}; exhaustively proven against {} unsafe predicate(s) over {} signal(s)",
        verdict.reason,
        predicates.len(),
        expr.free_variables().len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::rules::ForbiddenRule;
    use common::Status;
    use proptest::prelude::*;
    use proptest::test_runner::{FileFailurePersistence, RngAlgorithm};

    fn expr(text: &str) -> Expr {
        parse(text).unwrap()
    }

    fn cx(pairs: &[(&str, bool)]) -> Counterexample {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn policy() -> RuleConfig {
        RuleConfig::new(
            vec!["EmergencyStopButton".into()],
            vec![
                ForbiddenRule {
                    id: "FR-001".into(),
                    name: "Motor under overload".into(),
                    active_signal: "MotorRun".into(),
                    forbidden_with: "OverloadRelay".into(),
                    risk_level: RiskLevel::High,
                    consequence: "Winding burnout".into(),
                },
                ForbiddenRule {
                    id: "FR-002".into(),
                    name: "Press with door open".into(),
                    active_signal: "PressActive".into(),
                    forbidden_with: "SafetyDoorOpen".into(),
                    risk_level: RiskLevel::Critical,
                    consequence: "Crush injury".into(),
                },
            ],
        )
        .unwrap()
    }

    fn assignment(output: &str, text: &str) -> Assignment {
        Assignment {
            output_variable: output.into(),
            expression_text: text.into(),
        }
    }

    #[test]
    fn test_safe_expression_has_no_counterexample() {
        let result = find_counterexample(
            &expr("StartButton AND NOT EmergencyStopButton"),
            &expr("EmergencyStopButton"),
        );
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_first_witness_in_enumeration_order() {
        // Order: A=F,B=F / A=F,B=T / A=T,B=F / A=T,B=T.
        let found = find_counterexample(&expr("A OR B"), &expr("B")).unwrap();
        assert_eq!(found, Some(cx(&[("A", false), ("B", true)])));

        let found = find_counterexample(&expr("A OR B"), &expr("A")).unwrap();
        assert_eq!(found, Some(cx(&[("A", true), ("B", false)])));
    }

    #[test]
    fn test_counterexample_covers_predicate_only_signals() {
        let found = find_counterexample(&expr("Start"), &expr("Door")).unwrap();
        assert_eq!(found, Some(cx(&[("Door", true), ("Start", true)])));
    }

    #[test]
    fn test_state_space_limit() {
        let names: Vec<String> = (0..=MAX_EXHAUSTIVE_VARIABLES).map(|i| format!("S{i}")).collect();
        let wide = parse(&names.join(" AND ")).unwrap();
        assert_eq!(
            find_counterexample(&wide, &expr("S0")),
            Err(OracleError::StateSpaceTooLarge {
                variables: MAX_EXHAUSTIVE_VARIABLES + 1,
                limit: MAX_EXHAUSTIVE_VARIABLES,
            })
        );
    }

    #[test]
    fn test_predicates_for_output_and_inputs() {
        let e = expr("Start AND PressActive AND MotorRun AND NOT EmergencyStopButton");
        let predicates = unsafe_predicates(&policy(), &e);
        let rendered: Vec<String> = predicates.iter().map(|p| p.expr.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "EmergencyStopButton",
                "MotorRun AND OverloadRelay",
                "PressActive AND SafetyDoorOpen"
            ]
        );
        assert_eq!(predicates[1].risk_level, RiskLevel::High);
        assert_eq!(predicates[2].risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_rule_on_output_adds_no_predicate() {
        // FR-001 names MotorRun as its active signal; as the assigned output it
        // is not an input, so only the mandatory interlock is checked.
        let e = expr("StartButton AND NOT EmergencyStopButton");
        let predicates = unsafe_predicates(&policy(), &e);
        assert_eq!(predicates.len(), 1);
        assert_eq!(predicates[0].expr, Expr::var("EmergencyStopButton"));

        let a = assignment("MotorRun", "StartButton AND NOT EmergencyStopButton");
        let result = verify(Some(&a), &policy(), ProofMode::Exhaustive);
        assert_eq!(result.status, Status::Safe, "{}", result.reason);
        assert!(result.reason.contains("1 unsafe predicate(s) over 2 signal(s)"));
    }

    #[test]
    fn test_unrelated_forbidden_rules_skipped() {
        let e = expr("Start AND NOT EmergencyStopButton");
        let predicates = unsafe_predicates(&policy(), &e);
        assert_eq!(predicates.len(), 1);
    }

    #[test]
    fn test_verify_proves_guarded_output() {
        let a = assignment(
            "ConveyorRun",
            "StartButton AND MotorRun AND NOT EmergencyStopButton AND NOT OverloadRelay",
        );
        let result = verify(Some(&a), &policy(), ProofMode::Exhaustive);
        assert_eq!(result.status, Status::Safe, "{}", result.reason);
        assert!(result.reason.contains("exhaustively proven"));
        assert_eq!(result.counterexample, None);
    }

    #[test]
    fn test_verify_finds_unguarded_overload() {
        let a = assignment("ConveyorRun", "StartButton AND MotorRun AND NOT EmergencyStopButton");
        assert!(warden::check(Some(&a.expression_text), &policy()).is_safe());

        let result = verify(Some(&a), &policy(), ProofMode::Exhaustive);
        assert_eq!(result.kind, Some(ViolationKind::Counterexample));
        assert_eq!(result.risk_level, RiskLevel::High);
        assert_eq!(
            result.counterexample,
            Some(cx(&[
                ("EmergencyStopButton", false),
                ("MotorRun", true),
                ("OverloadRelay", true),
                ("StartButton", true),
            ]))
        );
        assert!(result.reason.contains("FR-001"));
    }

    #[test]
    fn test_verify_static_mode_skips_proof() {
        let a = assignment("ConveyorRun", "StartButton AND MotorRun AND NOT EmergencyStopButton");
        let result = verify(Some(&a), &policy(), ProofMode::Static);
        assert!(result.is_safe());
        assert!(!result.reason.contains("exhaustively proven"));
    }

    #[test]
    fn test_verify_nested_disjunction_caught_by_proof() {
        // Statically opaque: the bypass lives inside parentheses.
        let a = assignment("ConveyorRun", "(Start AND NOT EmergencyStopButton OR Jog) AND Guard");
        assert!(warden::check(Some(&a.expression_text), &policy()).is_safe());

        let result = verify(Some(&a), &policy(), ProofMode::Exhaustive);
        assert_eq!(result.kind, Some(ViolationKind::Counterexample));
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert_eq!(
            result.counterexample,
            Some(cx(&[
                ("EmergencyStopButton", true),
                ("Guard", true),
                ("Jog", true),
                ("Start", false),
            ]))
        );
    }

    #[test]
    fn test_verify_nested_guarded_disjunction_safe() {
        let a = assignment("ConveyorRun", "(Start OR NOT Guard) AND NOT EmergencyStopButton");
        assert!(verify(Some(&a), &policy(), ProofMode::Exhaustive).is_safe());
    }

    #[test]
    fn test_verify_static_violation_passes_through() {
        let a = assignment("MotorRun", "StartButton OR EmergencyStopButton");
        let result = verify(Some(&a), &policy(), ProofMode::Exhaustive);
        assert_eq!(result.kind, Some(ViolationKind::DisjunctionBypass));
        assert_eq!(result.counterexample, None);
    }

    #[test]
    fn test_verify_absent_assignment() {
        let result = verify(None, &policy(), ProofMode::Exhaustive);
        assert_eq!(result.kind, Some(ViolationKind::ExtractionFailure));
        assert_eq!(result.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn test_verify_state_space_fails_closed() {
        let mut terms: Vec<String> = (0..MAX_EXHAUSTIVE_VARIABLES).map(|i| format!("S{i}")).collect();
        terms.push("NOT EmergencyStopButton".into());
        let a = assignment("LampOutput", &terms.join(" AND "));
        let result = verify(Some(&a), &policy(), ProofMode::Exhaustive);
        assert_eq!(result.status, Status::Violation);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert_eq!(result.kind, Some(ViolationKind::StateSpaceTooLarge));
    }

    const NAMES: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

    fn arb_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            4 => prop::sample::select(NAMES.to_vec()).prop_map(Expr::var),
            1 => any::<bool>().prop_map(Expr::Const),
        ];
        leaf.prop_recursive(4, 24, 2, |inner| {
            prop_oneof![
                inner.clone().prop_map(Expr::not),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::and(a, b)),
                (inner.clone(), inner).prop_map(|(a, b)| Expr::or(a, b)),
            ]
        })
    }

    /// Reference: every assignment of all six names, no ordering guarantees.
    fn brute_force_satisfiable(e: &Expr, p: &Expr) -> bool {
        (0u32..1 << NAMES.len()).any(|mask| {
            let env: BTreeMap<String, bool> = NAMES
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), mask & (1 << i) != 0))
                .collect();
            e.evaluate(&env).unwrap() && p.evaluate(&env).unwrap()
        })
    }

    fn proptest_config() -> ProptestConfig {
        ProptestConfig {
            cases: 256,
            source_file: Some(file!()),
            failure_persistence: Some(Box::new(FileFailurePersistence::WithSource(
                "proptest-regressions",
            ))),
            rng_algorithm: RngAlgorithm::ChaCha,
            ..ProptestConfig::default()
        }
    }

    proptest! {
        #![proptest_config(proptest_config())]

        #[test]
        fn prop_sound_and_complete(e in arb_expr(), p in arb_expr()) {
            let found = find_counterexample(&e, &p).unwrap();
            prop_assert_eq!(found.is_some(), brute_force_satisfiable(&e, &p));

            if let Some(witness) = found {
                prop_assert!(e.evaluate(&witness).unwrap());
                prop_assert!(p.evaluate(&witness).unwrap());
                let mut expected = e.free_variables();
                expected.extend(p.free_variables());
                let keys: std::collections::BTreeSet<String> = witness.keys().cloned().collect();
                prop_assert_eq!(keys, expected);
            }
        }
    }
}
