//! Compliance reporting.
//!
//! Builds a point-in-time compliance report from the ledger's latest
//! records and the framework definition, and renders it as JSON or a
//! self-contained static HTML evidence pack.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::evidence::{ComplianceStatus, Severity};
use crate::ledger::{Ledger, LedgerError};
use crate::mapping::Framework;

/// Errors from report generation.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Reading from the ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Serializing the report failed.
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Writing the report failed.
    #[error("failed to write report to {path}: {source}")]
    Io {
        /// Output path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// One control's standing in the report.
#[derive(Debug, Clone, Serialize)]
pub struct ControlEntry {
    /// Control identifier.
    pub control_id: String,
    /// Control name.
    pub name: String,
    /// Grouping category.
    pub category: String,
    /// Latest status (`NOT_COLLECTED` when no record exists).
    pub status: ComplianceStatus,
    /// Latest severity.
    pub severity: Severity,
    /// Latest verdict note.
    pub note: String,
    /// When the latest evidence was collected, if ever.
    pub collected_at: Option<DateTime<Utc>>,
    /// Which collector produced the latest evidence.
    pub source: Option<String>,
}

/// Aggregate counts across all controls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportTotals {
    /// Number of controls in the framework.
    pub total_controls: usize,
    /// Controls with at least one evidence record.
    pub assessed: usize,
    /// Compliant controls.
    pub compliant: usize,
    /// Partially compliant controls.
    pub partial: usize,
    /// Non-compliant controls.
    pub non_compliant: usize,
    /// Controls whose last collection errored.
    pub errors: usize,
    /// Controls awaiting manual assessment.
    pub manual: usize,
    /// Controls never collected.
    pub not_collected: usize,
}

/// A point-in-time compliance report.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
    /// Framework name.
    pub framework: String,
    /// Framework version.
    pub framework_version: String,
    /// Aggregate counts.
    pub totals: ReportTotals,
    /// Every control's standing, sorted by control ID.
    pub controls: Vec<ControlEntry>,
}

impl ComplianceReport {
    /// Builds a report from the ledger's latest records per control.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn build(ledger: &Ledger, framework: &Framework) -> Result<Self, ReportError> {
        let latest = ledger.latest_by_control()?;

        let mut controls = Vec::with_capacity(framework.controls.len());
        let mut totals = ReportTotals {
            total_controls: framework.controls.len(),
            ..ReportTotals::default()
        };

        for (control_id, control) in &framework.controls {
            let entry = match latest.get(control_id) {
                Some(record) => {
                    totals.assessed += 1;
                    match record.finding.status {
                        ComplianceStatus::Compliant => totals.compliant += 1,
                        ComplianceStatus::Partial => totals.partial += 1,
                        ComplianceStatus::NonCompliant => totals.non_compliant += 1,
                        ComplianceStatus::CollectionError => totals.errors += 1,
                        ComplianceStatus::ManualRequired => totals.manual += 1,
                        ComplianceStatus::NotCollected => {}
                    }
                    ControlEntry {
                        control_id: control_id.clone(),
                        name: control.name.clone(),
                        category: control.category.clone(),
                        status: record.finding.status,
                        severity: record.finding.severity,
                        note: record.finding.note.clone(),
                        collected_at: Some(record.collected_at),
                        source: Some(record.source.clone()),
                    }
                }
                None => {
                    totals.not_collected += 1;
                    ControlEntry {
                        control_id: control_id.clone(),
                        name: control.name.clone(),
                        category: control.category.clone(),
                        status: ComplianceStatus::NotCollected,
                        severity: Severity::None,
                        note: "No evidence collected".to_string(),
                        collected_at: None,
                        source: None,
                    }
                }
            };
            controls.push(entry);
        }

        Ok(Self {
            generated_at: Utc::now(),
            framework: framework.name.clone(),
            framework_version: framework.version.clone(),
            totals,
            controls,
        })
    }

    /// Controls that are not fully compliant, in report order.
    #[must_use]
    pub fn gaps(&self) -> Vec<&ControlEntry> {
        self.controls
            .iter()
            .filter(|entry| entry.status != ComplianceStatus::Compliant)
            .collect()
    }

    /// Renders the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Renders the report as a self-contained static HTML page.
    #[must_use]
    pub fn to_html(&self) -> String {
        let mut rows = String::new();
        let mut current_category = None::<&str>;

        for entry in &self.controls {
            if current_category != Some(entry.category.as_str()) {
                current_category = Some(entry.category.as_str());
                rows.push_str(&format!(
                    "<tr class=\"category\"><td colspan=\"5\">{}</td></tr>\n",
                    escape(&entry.category)
                ));
            }
            let collected = entry
                .collected_at
                .map_or_else(|| "—".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td class=\"status-{}\">{}</td><td>{}</td><td>{}</td></tr>\n",
                escape(&entry.control_id),
                escape(&entry.name),
                entry.status.as_str().to_lowercase(),
                entry.status,
                escape(&entry.note),
                collected,
            ));
        }

        let totals = &self.totals;
        format!(
            include_str!("evidence_pack.html"),
            framework = escape(&self.framework),
            version = escape(&self.framework_version),
            generated_at = self.generated_at.format("%Y-%m-%d %H:%M UTC"),
            total = totals.total_controls,
            compliant = totals.compliant,
            partial = totals.partial,
            non_compliant = totals.non_compliant,
            errors = totals.errors,
            manual = totals.manual,
            not_collected = totals.not_collected,
            rows = rows,
        )
    }

    /// Writes the report to `path` in the given format.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or the write fails.
    pub fn write_to(&self, path: &std::path::Path, html: bool) -> Result<(), ReportError> {
        let content = if html { self.to_html() } else { self.to_json()? };
        std::fs::write(path, content).map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Minimal HTML escaping for text content.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
