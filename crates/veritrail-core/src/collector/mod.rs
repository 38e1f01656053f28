//! Evidence collector capability.
//!
//! A collector is the pluggable seam between the orchestrator and an
//! external evidence source: given a [`CollectionTask`] it returns
//! [`RawEvidence`] (a structured summary plus the verbatim payload) or a
//! classified failure. Collectors are registered in a
//! [`CollectorRegistry`] keyed by source ID; the registry is read-only
//! during a run and shared freely across workers.
//!
//! Collectors never assign findings — the evaluator owns verdicts. A
//! collector that cannot produce a scoreable summary simply returns one
//! that no rule will match, which resolves to `MANUAL_REQUIRED`.

mod directory;
mod document;
mod manual;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::evidence::{EvidenceType, Summary};

pub use directory::{DirectoryApi, DirectoryCollector};
pub use document::DocumentCollector;
pub use manual::ManualCollector;

/// One unit of evidence-gathering work: a control × collector pairing,
/// produced by expanding the control mapping. Immutable once created and
/// consumed once per collection run.
#[derive(Debug, Clone)]
pub struct CollectionTask {
    /// Control this task gathers evidence for.
    pub control_id: String,
    /// Human-readable control name, carried into the record.
    pub control_name: String,
    /// Task identifier, unique within the control.
    pub task_id: String,
    /// Which registered collector handles this task.
    pub source: String,
    /// Endpoint or locator for the collector.
    pub endpoint: String,
    /// Description, used in dry-run output and manual placeholders.
    pub description: String,
    /// Kind of evidence this task produces.
    pub evidence_type: EvidenceType,
    /// Free-form collector parameters from the mapping.
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Raw evidence returned by a collector: the structured summary the
/// evaluator may read, and the opaque payload preserved for audit.
#[derive(Debug, Clone)]
pub struct RawEvidence {
    /// Structured scalar summary.
    pub summary: Summary,
    /// Verbatim payload; never interpreted by the core.
    pub raw_data: Option<serde_json::Value>,
}

/// A classified collection failure.
///
/// Transient failures are eligible for retry with backoff; terminal
/// failures are recorded immediately as `COLLECTION_ERROR`.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The collection call exceeded its deadline. Transient.
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    /// A network-level failure reaching the source. Transient.
    #[error("network error: {0}")]
    Network(String),

    /// The source signalled rate limiting. Transient.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Authentication or permission denial. Terminal.
    #[error("authentication or permission failure: {0}")]
    Auth(String),

    /// The source returned a response the collector cannot interpret.
    /// Terminal.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The task's endpoint or parameters are unusable. Terminal.
    #[error("endpoint error: {0}")]
    Endpoint(String),
}

impl CollectError {
    /// Whether this failure is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Network(_) | Self::RateLimited(_)
        )
    }
}

/// The collector capability: gather evidence for one task, and report
/// whether the underlying source is reachable at all.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Unique source identifier this collector registers under.
    fn source_id(&self) -> &str;

    /// Human-readable name for CLI output.
    fn display_name(&self) -> &str;

    /// Collects evidence for one task.
    ///
    /// # Errors
    ///
    /// Returns a classified [`CollectError`]; the orchestrator decides
    /// whether to retry based on [`CollectError::is_transient`].
    async fn collect(
        &self,
        control_id: &str,
        task: &CollectionTask,
    ) -> Result<RawEvidence, CollectError>;

    /// Tests connectivity and permissions. Used by preflight checks,
    /// never during a collection run.
    async fn healthcheck(&self) -> bool;
}

/// Read-only lookup of collectors by source ID.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collector under its own source ID. A later
    /// registration with the same ID replaces the earlier one.
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors
            .insert(collector.source_id().to_string(), collector);
    }

    /// Looks up a collector by source ID.
    #[must_use]
    pub fn get(&self, source_id: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(source_id).cloned()
    }

    /// Registered source IDs, sorted.
    #[must_use]
    pub fn source_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.collectors.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Runs every collector's healthcheck, returning `(source_id,
    /// display_name, healthy)` sorted by source ID.
    pub async fn healthcheck_all(&self) -> Vec<(String, String, bool)> {
        let mut results = Vec::with_capacity(self.collectors.len());
        for id in self.source_ids() {
            if let Some(collector) = self.get(id) {
                let healthy = collector.healthcheck().await;
                results.push((
                    id.to_string(),
                    collector.display_name().to_string(),
                    healthy,
                ));
            }
        }
        results
    }
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}
