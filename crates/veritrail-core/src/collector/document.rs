//! Document-based evidence collector.
//!
//! Scans a local documents directory for policy/procedure files and
//! keyword-scores them against the task's `keywords` parameter. Useful
//! for governance controls whose evidence is a written document rather
//! than a platform query: the summary reports how many documents exist
//! and how well the best one matches the expected topic.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::crypto::sha256_hex;
use crate::evidence::Summary;

use super::{CollectError, CollectionTask, Collector, RawEvidence};

/// File extensions treated as readable documents.
const DOCUMENT_EXTENSIONS: &[&str] = &["md", "txt"];

/// Collector that scores local documents against task keywords.
pub struct DocumentCollector {
    docs_dir: PathBuf,
}

impl DocumentCollector {
    /// Source ID this collector registers under.
    pub const SOURCE_ID: &'static str = "document";

    /// Creates a collector reading from `docs_dir`.
    #[must_use]
    pub fn new(docs_dir: impl AsRef<std::path::Path>) -> Self {
        Self {
            docs_dir: docs_dir.as_ref().to_path_buf(),
        }
    }

    fn keywords(task: &CollectionTask) -> Vec<String> {
        task.params
            .get("keywords")
            .and_then(Value::as_array)
            .map(|kws| {
                kws.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_document(path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
    }
}

#[async_trait]
impl Collector for DocumentCollector {
    fn source_id(&self) -> &str {
        Self::SOURCE_ID
    }

    fn display_name(&self) -> &str {
        "Document Evidence"
    }

    async fn collect(
        &self,
        control_id: &str,
        task: &CollectionTask,
    ) -> Result<RawEvidence, CollectError> {
        let keywords = Self::keywords(task);
        if keywords.is_empty() {
            return Err(CollectError::Endpoint(format!(
                "task {} has no 'keywords' parameter",
                task.task_id
            )));
        }

        let entries = std::fs::read_dir(&self.docs_dir).map_err(|e| {
            CollectError::Endpoint(format!(
                "documents directory {} unreadable: {e}",
                self.docs_dir.display()
            ))
        })?;

        let mut scored = Vec::new();
        let mut best_score = 0usize;
        let mut document_count = 0usize;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !Self::is_document(&path) {
                continue;
            }
            document_count += 1;

            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let haystack = content.to_lowercase();
            let hits = keywords.iter().filter(|kw| haystack.contains(*kw)).count();
            let score = hits * 100 / keywords.len();
            best_score = best_score.max(score);

            scored.push(serde_json::json!({
                "file": path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
                "sha256": sha256_hex(content.as_bytes()),
                "keyword_hits": hits,
                "score": score,
            }));
        }

        debug!(
            control_id,
            task_id = %task.task_id,
            documents = document_count,
            best_score,
            "documents scored"
        );

        let matching = scored
            .iter()
            .filter(|doc| doc["score"].as_u64().unwrap_or(0) > 0)
            .count();

        let mut summary = Summary::new();
        summary.insert("document_count".into(), document_count.into());
        summary.insert("matching_documents".into(), matching.into());
        summary.insert("best_match_score".into(), best_score.into());

        Ok(RawEvidence {
            summary,
            raw_data: Some(Value::Array(scored)),
        })
    }

    async fn healthcheck(&self) -> bool {
        self.docs_dir.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidenceType, SummaryValue};

    fn task_with_keywords(keywords: &[&str]) -> CollectionTask {
        let mut params = std::collections::BTreeMap::new();
        params.insert("keywords".to_string(), serde_json::json!(keywords));
        CollectionTask {
            control_id: "A.5.1".into(),
            control_name: "Policies for information security".into(),
            task_id: "security_policy".into(),
            source: DocumentCollector::SOURCE_ID.into(),
            endpoint: String::new(),
            description: String::new(),
            evidence_type: EvidenceType::Configuration,
            params,
        }
    }

    fn number(evidence: &RawEvidence, field: &str) -> f64 {
        match &evidence.summary[field] {
            SummaryValue::Number(n) => *n,
            other => panic!("{field} is not a number: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scores_documents_by_keywords() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("policy.md"),
            "# Information Security Policy\nOur ISMS covers acceptable use.",
        )
        .unwrap();
        std::fs::write(dir.path().join("lunch-menu.txt"), "soup of the day").unwrap();
        std::fs::write(dir.path().join("image.bin"), [0u8, 1, 2]).unwrap();

        let collector = DocumentCollector::new(dir.path());
        let evidence = collector
            .collect(
                "A.5.1",
                &task_with_keywords(&["information security policy", "isms", "acceptable use"]),
            )
            .await
            .unwrap();

        assert!((number(&evidence, "document_count") - 2.0).abs() < f64::EPSILON);
        assert!((number(&evidence, "matching_documents") - 1.0).abs() < f64::EPSILON);
        assert!((number(&evidence, "best_match_score") - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_keywords_parameter_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let collector = DocumentCollector::new(dir.path());

        let mut task = task_with_keywords(&[]);
        task.params.clear();
        let err = collector.collect("A.5.1", &task).await.unwrap_err();
        assert!(matches!(err, CollectError::Endpoint(_)));
    }

    #[tokio::test]
    async fn missing_directory_is_terminal_and_unhealthy() {
        let collector = DocumentCollector::new("/nonexistent/docs");
        assert!(!collector.healthcheck().await);

        let err = collector
            .collect("A.5.1", &task_with_keywords(&["policy"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectError::Endpoint(_)));
    }
}
