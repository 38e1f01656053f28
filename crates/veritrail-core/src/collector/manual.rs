//! Manual evidence placeholder collector.

use async_trait::async_trait;

use crate::evidence::Summary;

use super::{CollectError, CollectionTask, Collector, RawEvidence};

/// Collector for controls that cannot be automated.
///
/// Produces a text-only summary that no numeric rule can match, so the
/// evaluator resolves the record to `MANUAL_REQUIRED` — the correct
/// standing verdict until an analyst supplies evidence.
pub struct ManualCollector;

impl ManualCollector {
    /// Source ID this collector registers under.
    pub const SOURCE_ID: &'static str = "manual";
}

#[async_trait]
impl Collector for ManualCollector {
    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    fn display_name(&self) -> &str {
        "Manual Evidence"
    }

    async fn collect(
        &self,
        _control_id: &str,
        task: &CollectionTask,
    ) -> Result<RawEvidence, CollectError> {
        let description = if task.description.is_empty() {
            "Manual evidence required"
        } else {
            &task.description
        };

        let mut summary = Summary::new();
        summary.insert("description".into(), description.into());
        summary.insert("status".into(), "Awaiting manual upload".into());

        Ok(RawEvidence {
            summary,
            raw_data: None,
        })
    }

    async fn healthcheck(&self) -> bool {
        true
    }
}
