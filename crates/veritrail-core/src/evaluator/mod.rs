//! Condition evaluator.
//!
//! A pure function from `(ordered rule list, evidence summary)` to one
//! verdict. Rules are checked strictly in order and the first rule whose
//! condition holds supplies the verdict; remaining rules are not evaluated.
//! This first-match-wins ordering is a contract, not an optimization —
//! mappings rely on it to express threshold ladders
//! (`>= 100` → compliant, `>= 95` → partial, `< 95` → non-compliant).
//!
//! The evaluator holds no state and performs no I/O: identical inputs
//! always produce identical verdicts.

use tracing::debug;

use crate::evidence::{ComplianceStatus, Finding, Severity, Summary};
use crate::mapping::EvaluationRule;

/// Evaluates a summary against an ordered rule list.
///
/// - The first rule whose condition holds wins.
/// - A condition naming a field absent from the summary is false, never an
///   error; so is a field whose value has no numeric view.
/// - If no rule matches, the verdict is `MANUAL_REQUIRED`: nothing could be
///   resolved automatically.
#[must_use]
pub fn evaluate(rules: &[EvaluationRule], summary: &Summary) -> Finding {
    for rule in rules {
        if condition_holds(rule, summary) {
            debug!(
                condition = %rule.condition,
                status = %rule.status,
                "rule matched"
            );
            return Finding {
                status: rule.status,
                severity: rule.severity,
                note: rule.note.clone(),
            };
        }
    }

    Finding {
        status: ComplianceStatus::ManualRequired,
        severity: Severity::None,
        note: "No automatic rule matched; manual assessment required".to_string(),
    }
}

/// The fixed verdict for a task whose collection step failed outright.
///
/// Evaluation is skipped entirely — there is no summary to judge.
#[must_use]
pub fn collection_error(note: impl Into<String>) -> Finding {
    Finding::collection_error(note)
}

fn condition_holds(rule: &EvaluationRule, summary: &Summary) -> bool {
    let Some(value) = summary.get(&rule.condition.field) else {
        return false;
    };
    let Some(lhs) = value.as_number() else {
        return false;
    };
    rule.condition.op.apply(lhs, rule.condition.threshold)
}
