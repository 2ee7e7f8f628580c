//! # Rule Configuration Store
//!
//! The safety policy is loaded exactly once at startup and then shared
//! read-only (`Arc<RuleConfig>`) by every validation.
//!
//! Two load paths exist:
//! - [`RuleConfig::load`]: strict. Any problem is an error.
//! - [`load_or_empty`]: degrading. A missing or malformed file yields an
//!   empty, maximally permissive policy together with a [`RuleLoad`] outcome
//!   that the caller is expected to surface. The degradation is logged at
//!   `warn`/`error` level so it can never pass silently.

use crate::RiskLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Errors from loading or validating a rule document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rule file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("malformed rule document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

/// A configured pair of signals whose simultaneous unguarded presence is unsafe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenRule {
    pub id: String,
    pub name: String,
    pub active_signal: String,
    pub forbidden_with: String,
    pub risk_level: RiskLevel,
    #[serde(rename = "real_world_consequence")]
    pub consequence: String,
}

/// On-disk shape of `safety_rules.json`.
#[derive(Debug, Deserialize)]
struct RuleDocument {
    mandatory_signals: Vec<String>,
    #[serde(default)]
    forbidden_active_combinations: Vec<ForbiddenRule>,
}

/// Immutable safety policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleConfig {
    mandatory_signals: Vec<String>,
    forbidden_combinations: Vec<ForbiddenRule>,
}

impl RuleConfig {
    /// Builds a validated policy.
    ///
    /// Mandatory signals keep their first-seen order; duplicates are dropped.
    ///
    /// # Errors
    /// `ConfigError::InvalidRule` when a signal is not a valid identifier or a
    /// forbidden rule pairs a signal with itself.
    pub fn new(
        mandatory_signals: Vec<String>,
        forbidden_combinations: Vec<ForbiddenRule>,
    ) -> Result<Self, ConfigError> {
        let mut signals: Vec<String> = Vec::with_capacity(mandatory_signals.len());
        for signal in mandatory_signals {
            let signal = signal.trim().to_string();
            if !is_identifier(&signal) {
                return Err(ConfigError::InvalidRule(format!(
                    "mandatory signal `{signal}` is not a valid identifier"
                )));
            }
            if !signals.contains(&signal) {
                signals.push(signal);
            }
        }

        for rule in &forbidden_combinations {
            for signal in [&rule.active_signal, &rule.forbidden_with] {
                if !is_identifier(signal) {
                    return Err(ConfigError::InvalidRule(format!(
                        "rule {}: `{signal}` is not a valid identifier",
                        rule.id
                    )));
                }
            }
            if rule.active_signal == rule.forbidden_with {
                return Err(ConfigError::InvalidRule(format!(
                    "rule {}: active_signal and forbidden_with are both `{}`",
                    rule.id, rule.active_signal
                )));
            }
        }

        Ok(Self {
            mandatory_signals: signals,
            forbidden_combinations,
        })
    }

    /// The empty policy. Enforces nothing beyond extraction, syntax and constants.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a JSON rule document.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let doc: RuleDocument = serde_json::from_str(document)?;
        Self::new(doc.mandatory_signals, doc.forbidden_active_combinations)
    }

    /// Strict load from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn mandatory_signals(&self) -> &[String] {
        &self.mandatory_signals
    }

    pub fn forbidden_combinations(&self) -> &[ForbiddenRule] {
        &self.forbidden_combinations
    }

    pub fn is_empty(&self) -> bool {
        self.mandatory_signals.is_empty() && self.forbidden_combinations.is_empty()
    }

    /// BLAKE3 digest of the canonical policy rendering.
    ///
    /// Independent of file formatting: two documents that parse to the same
    /// policy share a fingerprint.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"safelogic.rules.v1\0");
        for signal in &self.mandatory_signals {
            hasher.update(b"M\0");
            hasher.update(signal.as_bytes());
            hasher.update(b"\0");
        }
        for rule in &self.forbidden_combinations {
            hasher.update(b"F\0");
            for field in [
                rule.id.as_str(),
                rule.name.as_str(),
                rule.active_signal.as_str(),
                rule.forbidden_with.as_str(),
                rule.risk_level.as_str(),
                rule.consequence.as_str(),
            ] {
                hasher.update(field.as_bytes());
                hasher.update(b"\0");
            }
        }
        *hasher.finalize().as_bytes()
    }

    pub fn fingerprint_hex(&self) -> String {
        blake3::Hash::from(self.fingerprint()).to_hex().to_string()
    }
}

/// How the policy came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleLoad {
    Loaded,
    /// The backing file does not exist. Policy is empty.
    Missing,
    /// The backing file exists but could not be used. Policy is empty.
    Malformed(String),
}

impl RuleLoad {
    /// `true` for both failure shapes; the policy in effect is the empty one.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, RuleLoad::Loaded)
    }
}

impl fmt::Display for RuleLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleLoad::Loaded => f.write_str("loaded"),
            RuleLoad::Missing => f.write_str("MISSING (empty ruleset in effect)"),
            RuleLoad::Malformed(reason) => {
                write!(f, "MALFORMED: {reason} (empty ruleset in effect)")
            }
        }
    }
}

/// Result of [`load_or_empty`].
#[derive(Debug, Clone)]
pub struct LoadedRules {
    pub path: PathBuf,
    pub config: RuleConfig,
    pub outcome: RuleLoad,
}

/// Degrading load: never fails, but reports how it got its policy.
pub fn load_or_empty(path: &Path) -> LoadedRules {
    let (config, outcome) = match RuleConfig::load(path) {
        Ok(config) => {
            info!(
                path = %path.display(),
                mandatory = config.mandatory_signals().len(),
                forbidden = config.forbidden_combinations().len(),
                "safety rules loaded"
            );
            (config, RuleLoad::Loaded)
        }
        Err(ConfigError::NotFound(_)) => {
            warn!(
                path = %path.display(),
                "safety rule file missing: running with an EMPTY ruleset, no interlocks enforced"
            );
            (RuleConfig::empty(), RuleLoad::Missing)
        }
        Err(e) => {
            error!(
                path = %path.display(),
                error = %e,
                "safety rule file unusable: running with an EMPTY ruleset, no interlocks enforced"
            );
            (RuleConfig::empty(), RuleLoad::Malformed(e.to_string()))
        }
    };

    LoadedRules {
        path: path.to_path_buf(),
        config,
        outcome,
    }
}

/// BLAKE3 digest of a rule file's raw bytes.
pub fn file_digest(path: &Path) -> Result<String, ConfigError> {
    let bytes = std::fs::read(path)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const DOC: &str = r#"{
        "mandatory_signals": ["EmergencyStopButton"],
        "forbidden_active_combinations": [
            {
                "id": "FR-001",
                "name": "Motor with overload",
                "active_signal": "MotorRun",
                "forbidden_with": "OverloadRelay",
                "risk_level": "HIGH",
                "real_world_consequence": "Winding burnout"
            }
        ]
    }"#;

    #[test]
    fn test_parse_document() {
        let config = RuleConfig::from_json_str(DOC).unwrap();
        assert_eq!(config.mandatory_signals(), ["EmergencyStopButton"]);
        let rule = &config.forbidden_combinations()[0];
        assert_eq!(rule.id, "FR-001");
        assert_eq!(rule.risk_level, RiskLevel::High);
        assert_eq!(rule.consequence, "Winding burnout");
    }

    #[test]
    fn test_forbidden_defaults_to_empty() {
        let config = RuleConfig::from_json_str(r#"{"mandatory_signals": ["EStop"]}"#).unwrap();
        assert!(config.forbidden_combinations().is_empty());
    }

    #[test]
    fn test_missing_mandatory_field_is_malformed() {
        let err = RuleConfig::from_json_str(r#"{"forbidden_active_combinations": []}"#);
        assert!(matches!(err, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_self_paired_rule_rejected() {
        let doc = r#"{
            "mandatory_signals": [],
            "forbidden_active_combinations": [{
                "id": "X", "name": "x", "active_signal": "A", "forbidden_with": "A",
                "risk_level": "LOW", "real_world_consequence": "none"
            }]
        }"#;
        assert!(matches!(
            RuleConfig::from_json_str(doc),
            Err(ConfigError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let doc = r#"{"mandatory_signals": ["Emergency Stop"]}"#;
        assert!(matches!(
            RuleConfig::from_json_str(doc),
            Err(ConfigError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_duplicate_signals_collapse() {
        let config =
            RuleConfig::new(vec!["A".into(), "B".into(), "A".into()], vec![]).unwrap();
        assert_eq!(config.mandatory_signals(), ["A", "B"]);
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let compact = DOC.split_whitespace().collect::<Vec<_>>().join(" ");
        let a = RuleConfig::from_json_str(DOC).unwrap();
        let b = RuleConfig::from_json_str(&compact).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), RuleConfig::empty().fingerprint());
        assert_eq!(a.fingerprint_hex().len(), 64);
    }

    #[test]
    fn test_load_or_empty_missing() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_or_empty(&dir.path().join("nope.json"));
        assert_eq!(loaded.outcome, RuleLoad::Missing);
        assert!(loaded.outcome.is_degraded());
        assert!(loaded.config.is_empty());
    }

    #[test]
    fn test_load_or_empty_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, "{ not json").unwrap();
        let loaded = load_or_empty(&path);
        assert!(matches!(loaded.outcome, RuleLoad::Malformed(_)));
        assert!(loaded.config.is_empty());
    }

    #[test]
    fn test_load_or_empty_ok_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, DOC).unwrap();
        let loaded = load_or_empty(&path);
        assert_eq!(loaded.outcome, RuleLoad::Loaded);
        assert!(!loaded.outcome.is_degraded());
        assert_eq!(loaded.config.mandatory_signals().len(), 1);
        assert_eq!(file_digest(&path).unwrap(), blake3::hash(DOC.as_bytes()).to_hex().to_string());
    }

    #[test]
    fn test_strict_load_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RuleConfig::load(&dir.path().join("nope.json")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("EmergencyStopButton"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}
