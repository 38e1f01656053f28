//! Evidence record model.
//!
//! An [`EvidenceRecord`] is the unit of truth for one collection task's
//! outcome at a point in time. Records are built by the orchestrator,
//! finalized by the evaluator, and frozen by the ledger: once a record's
//! `content_hash` is computed and persisted, no field is ever mutated —
//! a correction is always a new record.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::{self, CanonicalError};

/// Current record version for schema compatibility.
pub const CURRENT_RECORD_VERSION: u32 = 1;

/// Sentinel `previous_hash` for the first record in a control's chain.
pub const GENESIS_PREV_HASH: &str = "";

/// Compliance status assigned to an evidence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceStatus {
    /// The control's automatic check passed.
    Compliant,
    /// The control is partially satisfied.
    Partial,
    /// The control's automatic check failed.
    NonCompliant,
    /// No evidence has been collected yet.
    NotCollected,
    /// Evidence collection itself failed.
    CollectionError,
    /// No automatic rule resolved; a human must assess.
    ManualRequired,
}

impl ComplianceStatus {
    /// Stable string form, matching the persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compliant => "COMPLIANT",
            Self::Partial => "PARTIAL",
            Self::NonCompliant => "NON_COMPLIANT",
            Self::NotCollected => "NOT_COLLECTED",
            Self::CollectionError => "COLLECTION_ERROR",
            Self::ManualRequired => "MANUAL_REQUIRED",
        }
    }
}

impl std::fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComplianceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLIANT" => Ok(Self::Compliant),
            "PARTIAL" => Ok(Self::Partial),
            "NON_COMPLIANT" => Ok(Self::NonCompliant),
            "NOT_COLLECTED" => Ok(Self::NotCollected),
            "COLLECTION_ERROR" => Ok(Self::CollectionError),
            "MANUAL_REQUIRED" => Ok(Self::ManualRequired),
            other => Err(format!("unknown compliance status: {other}")),
        }
    }
}

/// Severity attached to a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// No severity (informational or compliant).
    None,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl Severity {
    /// Stable string form, matching the persisted representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Self::None),
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Kind of evidence a collection task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    /// Point-in-time state capture.
    #[default]
    Snapshot,
    /// Configuration or policy document.
    Configuration,
    /// Log or audit-trail sample.
    Log,
}

impl std::fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot => f.write_str("snapshot"),
            Self::Configuration => f.write_str("configuration"),
            Self::Log => f.write_str("log"),
        }
    }
}

/// The `(status, severity, note)` verdict carried by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Compliance status.
    pub status: ComplianceStatus,
    /// Severity of the finding.
    pub severity: Severity,
    /// Human-readable explanation.
    pub note: String,
}

impl Finding {
    /// The provisional finding a record carries before evaluation.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: ComplianceStatus::NotCollected,
            severity: Severity::None,
            note: "Pending evaluation".to_string(),
        }
    }

    /// A collection-error finding carrying the failure context.
    #[must_use]
    pub fn collection_error(note: impl Into<String>) -> Self {
        Self {
            status: ComplianceStatus::CollectionError,
            severity: Severity::High,
            note: note.into(),
        }
    }
}

/// A value in an evidence summary: the structured subset of raw evidence
/// that evaluation rules are allowed to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric measurement.
    Number(f64),
    /// Free-form text (never matched by numeric conditions).
    Text(String),
}

impl SummaryValue {
    /// Numeric view of the value, if it has one.
    ///
    /// Booleans coerce to `1.0` / `0.0`; text never coerces.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }
}

impl From<f64> for SummaryValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for SummaryValue {
    #[allow(clippy::cast_precision_loss)] // evidence counts stay far below 2^52
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<usize> for SummaryValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(v: usize) -> Self {
        Self::Number(v as f64)
    }
}

impl From<bool> for SummaryValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SummaryValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SummaryValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Evidence summary: field name → structured value.
pub type Summary = BTreeMap<String, SummaryValue>;

/// The persisted outcome of one collection task at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Record identifier, assigned at append (`ev-<date>-<control>-<suffix>`).
    pub evidence_id: String,

    /// Control this evidence belongs to.
    pub control_id: String,

    /// Human-readable control name.
    pub control_name: String,

    /// Task identifier, unique within the control.
    pub task_id: String,

    /// Collection timestamp (UTC).
    pub collected_at: DateTime<Utc>,

    /// Source identifier of the collector that produced this record.
    pub source: String,

    /// Version of the collector software.
    pub collector_version: String,

    /// Kind of evidence collected.
    pub evidence_type: EvidenceType,

    /// Record version for schema compatibility.
    pub record_version: u32,

    /// Structured summary the evaluator reads.
    pub summary: Summary,

    /// Verdict; provisional until the evaluator runs, frozen at append.
    pub finding: Finding,

    /// Opaque raw payload, preserved verbatim for audit. Stored as a
    /// separate artifact file by the ledger, never interpreted by the core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,

    /// SHA-256 hex digest of the canonical record; computed at append.
    #[serde(default)]
    pub content_hash: String,

    /// `content_hash` of the preceding record for this control, or
    /// [`GENESIS_PREV_HASH`]; computed at append.
    #[serde(default)]
    pub previous_hash: String,
}

impl EvidenceRecord {
    /// Creates a provisional record with a pending finding and the current
    /// timestamp. Hash fields are populated by the ledger at append.
    #[must_use]
    pub fn new(
        control_id: impl Into<String>,
        control_name: impl Into<String>,
        task_id: impl Into<String>,
        source: impl Into<String>,
        evidence_type: EvidenceType,
    ) -> Self {
        Self {
            evidence_id: String::new(),
            control_id: control_id.into(),
            control_name: control_name.into(),
            task_id: task_id.into(),
            collected_at: Utc::now(),
            source: source.into(),
            collector_version: env!("CARGO_PKG_VERSION").to_string(),
            evidence_type,
            record_version: CURRENT_RECORD_VERSION,
            summary: Summary::new(),
            finding: Finding::pending(),
            raw_data: None,
            content_hash: String::new(),
            previous_hash: String::new(),
        }
    }

    /// Sets the summary (builder pattern).
    #[must_use]
    pub fn with_summary(mut self, summary: Summary) -> Self {
        self.summary = summary;
        self
    }

    /// Sets the raw payload (builder pattern).
    #[must_use]
    pub fn with_raw_data(mut self, raw_data: serde_json::Value) -> Self {
        self.raw_data = Some(raw_data);
        self
    }

    /// The fixed-precision timestamp string used in the canonical form
    /// and the persisted row. Microsecond precision keeps the value stable
    /// through a store/load round trip.
    #[must_use]
    pub fn canonical_timestamp(&self) -> String {
        self.collected_at
            .to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// The canonical view of a record that the content hash is computed over.
///
/// Excludes both hash fields (spec'd hash input) and the raw payload body;
/// the raw payload participates via its own digest so artifact tampering
/// is still detectable. Field order is irrelevant: serialization goes
/// through RFC 8785 canonicalization, which sorts keys.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalEvidence<'a> {
    /// Record identifier.
    pub evidence_id: &'a str,
    /// Control identifier.
    pub control_id: &'a str,
    /// Control name.
    pub control_name: &'a str,
    /// Task identifier.
    pub task_id: &'a str,
    /// RFC 3339 collection timestamp at microsecond precision.
    pub collected_at: &'a str,
    /// Collector source identifier.
    pub source: &'a str,
    /// Collector version.
    pub collector_version: &'a str,
    /// Evidence kind.
    pub evidence_type: EvidenceType,
    /// Record schema version.
    pub record_version: u32,
    /// Structured summary.
    pub summary: &'a Summary,
    /// Final verdict.
    pub finding: &'a Finding,
    /// SHA-256 hex digest of the raw artifact, if one was stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data_sha256: Option<&'a str>,
}

impl CanonicalEvidence<'_> {
    /// Canonical (RFC 8785) byte representation — the content-hash input.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical::to_canonical_bytes(self)
    }
}
