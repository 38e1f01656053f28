//! Control-mapping definitions.
//!
//! A framework mapping is a YAML document that declares, per control, the
//! collector tasks that gather its evidence and the ordered evaluation
//! rules that judge it. Rule conditions are parsed into a typed
//! [`Condition`] here, at load time — the evaluator never sees the string
//! form, and a malformed condition fails the load rather than silently
//! evaluating false forever.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::evidence::{ComplianceStatus, EvidenceType, Severity};

/// Errors from loading or interpreting a framework mapping.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// The mapping file could not be read.
    #[error("failed to read mapping file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The mapping file is not valid YAML or has the wrong shape.
    #[error("invalid mapping document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An evaluation rule condition could not be parsed.
    #[error("control {control_id}: unparsable condition '{condition}'")]
    InvalidCondition {
        /// Control the rule belongs to.
        control_id: String,
        /// The offending condition string.
        condition: String,
    },

    /// The mapping declares no controls.
    #[error("mapping '{0}' declares no controls")]
    Empty(String),
}

/// Comparison operator in a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `==`
    Eq,
    /// `!=`
    Ne,
}

impl CompareOp {
    /// Applies the operator to `lhs <op> rhs`.
    #[must_use]
    #[allow(clippy::float_cmp)] // thresholds are compared exactly, as written
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// A parsed rule condition: `field <op> threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Summary field the condition reads.
    pub field: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Numeric threshold.
    pub threshold: f64,
}

fn condition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\w+)\s*(>=|<=|==|!=|>|<)\s*(-?\d+(?:\.\d+)?)$")
            .unwrap_or_else(|e| unreachable!("condition pattern is valid: {e}"))
    })
}

impl Condition {
    /// Parses a condition string like `mfa_coverage >= 95`.
    ///
    /// Returns `None` if the string doesn't match the supported shape.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let caps = condition_pattern().captures(input.trim())?;
        let op = match &caps[2] {
            ">=" => CompareOp::Ge,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            "<" => CompareOp::Lt,
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            _ => return None,
        };
        let threshold: f64 = caps[3].parse().ok()?;
        Some(Self {
            field: caps[1].to_string(),
            op,
            threshold,
        })
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.field, self.op, self.threshold)
    }
}

/// One ordered evaluation rule: first rule whose condition holds wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRule {
    /// Parsed condition.
    pub condition: Condition,
    /// Status assigned when the condition holds.
    pub status: ComplianceStatus,
    /// Severity assigned when the condition holds.
    pub severity: Severity,
    /// Note attached to the verdict.
    pub note: String,
}

/// A collector task declaration from the mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    /// Task identifier, unique within its control.
    pub id: String,

    /// Which registered collector handles this task.
    pub source: String,

    /// Endpoint or locator the collector should query.
    #[serde(default)]
    pub endpoint: String,

    /// Human-readable description, used in dry-run output.
    #[serde(default)]
    pub description: String,

    /// Kind of evidence this task produces.
    #[serde(default)]
    pub evidence_type: EvidenceType,

    /// Remote-side permissions the task needs, for preflight reporting.
    #[serde(default)]
    pub required_permissions: Vec<String>,

    /// Free-form collector parameters.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// One control in the framework.
#[derive(Debug, Clone)]
pub struct Control {
    /// Control identifier (e.g. `A.5.17`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Grouping category.
    pub category: String,
    /// Longer description.
    pub description: String,
    /// Ordered collector tasks.
    pub tasks: Vec<TaskDef>,
    /// Ordered evaluation rules; order is significant.
    pub rules: Vec<EvaluationRule>,
}

/// A compliance framework loaded from a mapping document.
#[derive(Debug, Clone)]
pub struct Framework {
    /// Framework name.
    pub name: String,
    /// Framework version string.
    pub version: String,
    /// Controls keyed by ID.
    pub controls: BTreeMap<String, Control>,
}

impl Framework {
    /// Looks up a control by ID.
    #[must_use]
    pub fn control(&self, control_id: &str) -> Option<&Control> {
        self.controls.get(control_id)
    }

    /// All control IDs, sorted.
    #[must_use]
    pub fn control_ids(&self) -> Vec<&str> {
        self.controls.keys().map(String::as_str).collect()
    }

    /// Controls grouped by category.
    #[must_use]
    pub fn controls_by_category(&self) -> BTreeMap<&str, Vec<&Control>> {
        let mut by_cat: BTreeMap<&str, Vec<&Control>> = BTreeMap::new();
        for control in self.controls.values() {
            by_cat.entry(control.category.as_str()).or_default().push(control);
        }
        by_cat
    }

    /// Union of remote-side permissions required by all declared tasks.
    #[must_use]
    pub fn required_permissions(&self) -> BTreeSet<&str> {
        self.controls
            .values()
            .flat_map(|c| &c.tasks)
            .flat_map(|t| &t.required_permissions)
            .map(String::as_str)
            .collect()
    }
}

// Raw deserialization shapes; conditions are still strings here.

#[derive(Debug, Deserialize)]
struct RawFramework {
    #[serde(default = "unknown_name")]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    controls: BTreeMap<String, RawControl>,
}

fn unknown_name() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Deserialize)]
struct RawControl {
    #[serde(default)]
    name: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    collectors: Vec<TaskDef>,
    #[serde(default)]
    evaluation: RawEvaluation,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvaluation {
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    condition: String,
    status: ComplianceStatus,
    #[serde(default = "default_severity")]
    severity: Severity,
    #[serde(default)]
    note: String,
}

const fn default_severity() -> Severity {
    Severity::None
}

/// Loads a framework mapping from a YAML file.
///
/// # Errors
///
/// Returns [`MappingError`] if the file cannot be read, is not valid YAML,
/// declares no controls, or contains an unparsable rule condition.
pub fn load_framework(path: &Path) -> Result<Framework, MappingError> {
    let content = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let framework = parse_framework(&content)?;
    info!(
        framework = %framework.name,
        controls = framework.controls.len(),
        path = %path.display(),
        "loaded framework mapping"
    );
    Ok(framework)
}

/// Parses a framework mapping from a YAML string.
///
/// # Errors
///
/// Same conditions as [`load_framework`], minus file I/O.
pub fn parse_framework(content: &str) -> Result<Framework, MappingError> {
    let raw: RawFramework = serde_yaml::from_str(content)?;

    if raw.controls.is_empty() {
        return Err(MappingError::Empty(raw.name));
    }

    let mut controls = BTreeMap::new();
    for (control_id, raw_control) in raw.controls {
        let mut rules = Vec::with_capacity(raw_control.evaluation.rules.len());
        for rule in raw_control.evaluation.rules {
            let condition = Condition::parse(&rule.condition).ok_or_else(|| {
                MappingError::InvalidCondition {
                    control_id: control_id.clone(),
                    condition: rule.condition.clone(),
                }
            })?;
            rules.push(EvaluationRule {
                condition,
                status: rule.status,
                severity: rule.severity,
                note: rule.note,
            });
        }

        controls.insert(
            control_id.clone(),
            Control {
                id: control_id,
                name: raw_control.name,
                category: raw_control.category,
                description: raw_control.description,
                tasks: raw_control.collectors,
                rules,
            },
        );
    }

    Ok(Framework {
        name: raw.name,
        version: raw.version,
        controls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: Test Framework
version: "1.0"
controls:
  A.5.17:
    name: Authentication information
    category: Identity
    description: MFA must be enforced for all users.
    collectors:
      - id: mfa_enrollment
        source: directory_platform
        endpoint: /reports/authenticationMethods/userRegistrationDetails
        evidence_type: snapshot
        required_permissions: [Reports.Read.All]
    evaluation:
      rules:
        - condition: "mfa_coverage >= 100"
          status: COMPLIANT
          severity: NONE
          note: All users registered for MFA
        - condition: "mfa_coverage >= 95"
          status: PARTIAL
          severity: MEDIUM
          note: MFA coverage below 100%
        - condition: "mfa_coverage < 95"
          status: NON_COMPLIANT
          severity: HIGH
          note: MFA coverage below 95%
  A.8.2:
    name: Privileged access rights
    category: Identity
    collectors:
      - id: privileged_roles
        source: directory_platform
        endpoint: /directoryRoles
        required_permissions: [RoleManagement.Read.Directory]
    evaluation:
      rules:
        - condition: "global_admin_count <= 5"
          status: COMPLIANT
          severity: NONE
          note: Global admin count within policy
"#;

    #[test]
    fn parses_sample_framework() {
        let fw = parse_framework(SAMPLE).unwrap();
        assert_eq!(fw.name, "Test Framework");
        assert_eq!(fw.controls.len(), 2);

        let control = fw.control("A.5.17").unwrap();
        assert_eq!(control.tasks.len(), 1);
        assert_eq!(control.tasks[0].evidence_type, EvidenceType::Snapshot);
        assert_eq!(control.rules.len(), 3);
        assert_eq!(control.rules[0].condition.field, "mfa_coverage");
        assert_eq!(control.rules[0].condition.op, CompareOp::Ge);
        assert_eq!(control.rules[0].status, ComplianceStatus::Compliant);
    }

    #[test]
    fn rule_order_is_preserved() {
        let fw = parse_framework(SAMPLE).unwrap();
        let rules = &fw.control("A.5.17").unwrap().rules;
        let thresholds: Vec<f64> = rules.iter().map(|r| r.condition.threshold).collect();
        assert_eq!(thresholds, vec![100.0, 95.0, 95.0]);
    }

    #[test]
    fn condition_parse_variants() {
        let c = Condition::parse("global_admin_count <= 5").unwrap();
        assert_eq!(c.field, "global_admin_count");
        assert_eq!(c.op, CompareOp::Le);
        assert!((c.threshold - 5.0).abs() < f64::EPSILON);

        assert!(Condition::parse("coverage >= 97.5").is_some());
        assert!(Condition::parse("delta != -3").is_some());
        assert!(Condition::parse("count>0").is_some());

        assert!(Condition::parse("not a condition").is_none());
        assert!(Condition::parse("field => 5").is_none());
        assert!(Condition::parse("field >= five").is_none());
    }

    #[test]
    fn unparsable_condition_fails_load() {
        let bad = r#"
name: Bad
controls:
  C-1:
    name: Broken
    evaluation:
      rules:
        - condition: "coverage is at least 95"
          status: COMPLIANT
"#;
        let err = parse_framework(bad).unwrap_err();
        assert!(matches!(err, MappingError::InvalidCondition { .. }));
    }

    #[test]
    fn empty_mapping_is_an_error() {
        let err = parse_framework("name: Empty\ncontrols: {}\n").unwrap_err();
        assert!(matches!(err, MappingError::Empty(_)));
    }

    #[test]
    fn permission_union() {
        let fw = parse_framework(SAMPLE).unwrap();
        let perms = fw.required_permissions();
        assert!(perms.contains("Reports.Read.All"));
        assert!(perms.contains("RoleManagement.Read.Directory"));
        assert_eq!(perms.len(), 2);
    }

    #[test]
    fn controls_by_category_groups() {
        let fw = parse_framework(SAMPLE).unwrap();
        let by_cat = fw.controls_by_category();
        assert_eq!(by_cat["Identity"].len(), 2);
    }

    #[test]
    fn compare_op_semantics() {
        assert!(CompareOp::Ge.apply(97.0, 95.0));
        assert!(!CompareOp::Ge.apply(94.0, 95.0));
        assert!(CompareOp::Le.apply(5.0, 5.0));
        assert!(CompareOp::Gt.apply(1.0, 0.0));
        assert!(CompareOp::Lt.apply(-1.0, 0.0));
        assert!(CompareOp::Eq.apply(0.0, 0.0));
        assert!(CompareOp::Ne.apply(1.0, 0.0));
    }
}
