//! Collection orchestrator.
//!
//! Expands a framework mapping into collection tasks and drives them to
//! finalized, appended evidence records:
//!
//! 1. **Expand** the mapping into one task per control × collector pairing.
//! 2. **Dispatch** tasks over a bounded worker pool; tasks are independent
//!    and never block each other.
//! 3. **Collect** with a per-attempt timeout and bounded exponential-backoff
//!    retry — transient failures retry, terminal failures don't.
//! 4. **Evaluate** each successful summary against the control's rules.
//! 5. **Append** exactly one record per task (success or error outcome) —
//!    a control's absence of evidence is itself auditable.
//!
//! A single task's failure is isolated and recorded; the run only fails
//! fatally when no tasks could be enumerated or the ledger is unusable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::collector::{CollectError, CollectionTask, CollectorRegistry, RawEvidence};
use crate::evaluator;
use crate::evidence::{ComplianceStatus, EvidenceRecord};
use crate::ledger::{Ledger, LedgerError};
use crate::mapping::{EvaluationRule, Framework};

/// Errors that abort a collection run before task dispatch.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The mapping expanded to zero tasks.
    #[error("no collection tasks could be enumerated from the mapping")]
    NoTasks,

    /// The ledger is unusable.
    #[error("ledger unusable: {0}")]
    Ledger(#[from] LedgerError),
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Delay after the first failed attempt.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Upper bound on the delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier per retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculates the delay before retrying after `attempt` (1-based)
    /// failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt counts stay tiny
                let delay = Duration::from_secs_f64(
                    initial_delay.as_secs_f64() * multiplier.powi(attempt.saturating_sub(1) as i32),
                );
                delay.min(*max_delay)
            }
        }
    }
}

/// Collection run policy: concurrency bound, retry budget, timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionPolicy {
    /// Maximum number of tasks in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum collection attempts per task (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Deadline for a single collection attempt.
    #[serde(default = "default_attempt_timeout")]
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Backoff between retry attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CollectionPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            attempt_timeout: default_attempt_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Run-level cancellation flag.
///
/// Cancelling stops dispatch of new tasks and interrupts retry waits;
/// in-flight attempts run to completion so no half-written state is left
/// behind.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a fresh, uncancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-task retry state machine.
#[derive(Debug)]
enum TaskState {
    /// Waiting for its first attempt.
    Pending,
    /// An attempt is in flight.
    Attempting { attempt: u32 },
    /// Collection succeeded.
    Succeeded(RawEvidence),
    /// A transient failure; will retry after backoff.
    Retrying { attempt: u32, last_error: CollectError },
    /// Terminal failure, or retry budget exhausted.
    Failed { error: CollectError, attempts: u32 },
    /// The run was cancelled before this task finished.
    Cancelled,
}

/// The outcome of one task within a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Control the task belonged to.
    pub control_id: String,
    /// Task identifier.
    pub task_id: String,
    /// Final status of the task's record (or `NOT_COLLECTED` for a task
    /// skipped by cancellation).
    pub status: ComplianceStatus,
    /// Verdict note or failure description.
    pub note: String,
    /// Evidence ID of the appended record, when one was persisted.
    pub evidence_id: Option<String>,
}

/// Summary of a completed collection run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Number of tasks dispatched (including skipped-by-cancellation).
    pub total_tasks: usize,
    /// Per-status counts across all outcomes.
    pub status_counts: BTreeMap<ComplianceStatus, usize>,
    /// Every task's outcome, sorted by control then task.
    pub outcomes: Vec<TaskOutcome>,
    /// Wall-clock duration of the run.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Count of outcomes with the given status.
    #[must_use]
    pub fn count(&self, status: ComplianceStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}

/// A planned task, as reported by dry-run mode.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    /// Control the task belongs to.
    pub control_id: String,
    /// Control name.
    pub control_name: String,
    /// Task identifier.
    pub task_id: String,
    /// Collector source the task targets.
    pub source: String,
    /// Endpoint the task would query.
    pub endpoint: String,
    /// Whether the named collector is actually registered.
    pub collector_registered: bool,
}

/// Drives collection tasks to finalized evidence records.
pub struct Orchestrator {
    registry: Arc<CollectorRegistry>,
    ledger: Arc<Ledger>,
    policy: CollectionPolicy,
}

impl Orchestrator {
    /// Creates an orchestrator over a collector registry and a ledger.
    #[must_use]
    pub fn new(registry: Arc<CollectorRegistry>, ledger: Arc<Ledger>, policy: CollectionPolicy) -> Self {
        Self {
            registry,
            ledger,
            policy,
        }
    }

    /// Expands the mapping into collection tasks, optionally restricted to
    /// `targets` control IDs. Controls named in `targets` but absent from
    /// the mapping are ignored (the CLI warns about them separately).
    #[must_use]
    pub fn expand_tasks(framework: &Framework, targets: Option<&[String]>) -> Vec<CollectionTask> {
        let mut tasks = Vec::new();
        for (control_id, control) in &framework.controls {
            if let Some(targets) = targets {
                if !targets.iter().any(|t| t == control_id) {
                    continue;
                }
            }
            for def in &control.tasks {
                tasks.push(CollectionTask {
                    control_id: control_id.clone(),
                    control_name: control.name.clone(),
                    task_id: def.id.clone(),
                    source: def.source.clone(),
                    endpoint: def.endpoint.clone(),
                    description: def.description.clone(),
                    evidence_type: def.evidence_type,
                    params: def.params.clone(),
                });
            }
        }
        tasks
    }

    /// Dry-run: the task plan, without invoking any collector or touching
    /// the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoTasks`] if the mapping expands to
    /// nothing.
    pub fn plan(
        &self,
        framework: &Framework,
        targets: Option<&[String]>,
    ) -> Result<Vec<PlannedTask>, OrchestratorError> {
        let tasks = Self::expand_tasks(framework, targets);
        if tasks.is_empty() {
            return Err(OrchestratorError::NoTasks);
        }
        Ok(tasks
            .into_iter()
            .map(|task| PlannedTask {
                collector_registered: self.registry.get(&task.source).is_some(),
                control_id: task.control_id,
                control_name: task.control_name,
                task_id: task.task_id,
                source: task.source,
                endpoint: task.endpoint,
            })
            .collect())
    }

    /// Runs collection for the mapping, appending one record per task.
    ///
    /// # Errors
    ///
    /// Returns an error only for structural failures: zero tasks
    /// enumerated, or an unusable ledger. Per-task failures are recorded
    /// as `COLLECTION_ERROR` evidence and never abort the run.
    pub async fn run(
        &self,
        framework: &Framework,
        targets: Option<&[String]>,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, OrchestratorError> {
        let started = std::time::Instant::now();

        let tasks = Self::expand_tasks(framework, targets);
        if tasks.is_empty() {
            return Err(OrchestratorError::NoTasks);
        }

        // Fail fast if the ledger can't even be read — better than
        // discovering it after collectors have hammered the remote source.
        self.ledger.stats()?;

        let total_tasks = tasks.len();
        info!(
            tasks = total_tasks,
            max_concurrency = self.policy.max_concurrency,
            "collection run starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for task in tasks {
            let rules = framework
                .control(&task.control_id)
                .map(|c| c.rules.clone())
                .unwrap_or_default();
            let registry = Arc::clone(&self.registry);
            let ledger = Arc::clone(&self.ledger);
            let policy = self.policy.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                // Acquire never fails: the semaphore is never closed.
                let _permit = semaphore.acquire_owned().await;
                if cancel.is_cancelled() {
                    return TaskOutcome {
                        control_id: task.control_id.clone(),
                        task_id: task.task_id.clone(),
                        status: ComplianceStatus::NotCollected,
                        note: "run cancelled before dispatch".to_string(),
                        evidence_id: None,
                    };
                }
                run_task(&task, &rules, &registry, &ledger, &policy, &cancel).await
            });
        }

        let mut outcomes = Vec::with_capacity(total_tasks);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => warn!(error = %join_err, "collection task panicked"),
            }
        }

        outcomes.sort_by(|a, b| {
            (a.control_id.as_str(), a.task_id.as_str())
                .cmp(&(b.control_id.as_str(), b.task_id.as_str()))
        });

        let mut status_counts: BTreeMap<ComplianceStatus, usize> = BTreeMap::new();
        for outcome in &outcomes {
            *status_counts.entry(outcome.status).or_insert(0) += 1;
        }

        let summary = RunSummary {
            total_tasks,
            status_counts,
            outcomes,
            elapsed: started.elapsed(),
        };
        info!(
            tasks = summary.total_tasks,
            errors = summary.count(ComplianceStatus::CollectionError),
            elapsed = ?summary.elapsed,
            "collection run complete"
        );
        Ok(summary)
    }
}

/// Runs one task end to end: collect (with retry), evaluate, append.
async fn run_task(
    task: &CollectionTask,
    rules: &[EvaluationRule],
    registry: &CollectorRegistry,
    ledger: &Ledger,
    policy: &CollectionPolicy,
    cancel: &CancelFlag,
) -> TaskOutcome {
    let mut record = EvidenceRecord::new(
        &task.control_id,
        &task.control_name,
        &task.task_id,
        &task.source,
        task.evidence_type,
    );

    let state = match registry.get(&task.source) {
        Some(collector) => collect_with_retry(collector.as_ref(), task, policy, cancel).await,
        None => TaskState::Failed {
            error: CollectError::Endpoint(format!("no collector registered for '{}'", task.source)),
            attempts: 0,
        },
    };

    match state {
        TaskState::Succeeded(evidence) => {
            record.summary = evidence.summary;
            record.raw_data = evidence.raw_data;
            record.finding = evaluator::evaluate(rules, &record.summary);
        }
        TaskState::Failed { error, attempts } => {
            // The error itself is the evidence: an auditable record of
            // the control's missing data, entered into the chain.
            let note = if attempts > 1 {
                format!("{error} (after {attempts} attempts)")
            } else {
                error.to_string()
            };
            record
                .summary
                .insert("error".into(), note.as_str().into());
            record.finding = evaluator::collection_error(note);
        }
        TaskState::Cancelled => {
            return TaskOutcome {
                control_id: task.control_id.clone(),
                task_id: task.task_id.clone(),
                status: ComplianceStatus::NotCollected,
                note: "run cancelled mid-task".to_string(),
                evidence_id: None,
            };
        }
        // Loop states never escape collect_with_retry.
        TaskState::Pending | TaskState::Attempting { .. } | TaskState::Retrying { .. } => {
            unreachable!("non-terminal task state returned")
        }
    }

    match ledger.append(record) {
        Ok(frozen) => TaskOutcome {
            control_id: frozen.control_id,
            task_id: frozen.task_id,
            status: frozen.finding.status,
            note: frozen.finding.note,
            evidence_id: Some(frozen.evidence_id),
        },
        Err(err) => {
            warn!(
                control_id = %task.control_id,
                task_id = %task.task_id,
                error = %err,
                "failed to append evidence record"
            );
            TaskOutcome {
                control_id: task.control_id.clone(),
                task_id: task.task_id.clone(),
                status: ComplianceStatus::CollectionError,
                note: format!("ledger append failed: {err}"),
                evidence_id: None,
            }
        }
    }
}

/// The per-task retry state machine:
/// `Pending → Attempting → Succeeded | Retrying → Attempting … | Failed`.
async fn collect_with_retry(
    collector: &dyn crate::collector::Collector,
    task: &CollectionTask,
    policy: &CollectionPolicy,
    cancel: &CancelFlag,
) -> TaskState {
    let mut state = TaskState::Pending;

    loop {
        state = match state {
            TaskState::Pending => TaskState::Attempting { attempt: 1 },

            TaskState::Attempting { attempt } => {
                if cancel.is_cancelled() {
                    TaskState::Cancelled
                } else {
                    let result = tokio::time::timeout(
                        policy.attempt_timeout,
                        collector.collect(&task.control_id, task),
                    )
                    .await
                    .unwrap_or_else(|_elapsed| Err(CollectError::Timeout(policy.attempt_timeout)));

                    match result {
                        Ok(evidence) => TaskState::Succeeded(evidence),
                        Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                            TaskState::Retrying {
                                attempt,
                                last_error: error,
                            }
                        }
                        Err(error) => TaskState::Failed {
                            error,
                            attempts: attempt,
                        },
                    }
                }
            }

            TaskState::Retrying {
                attempt,
                last_error,
            } => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                debug!(
                    control_id = %task.control_id,
                    task_id = %task.task_id,
                    attempt,
                    delay = ?delay,
                    error = %last_error,
                    "transient failure; backing off"
                );
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    TaskState::Cancelled
                } else {
                    TaskState::Attempting {
                        attempt: attempt + 1,
                    }
                }
            }

            terminal @ (TaskState::Succeeded(_)
            | TaskState::Failed { .. }
            | TaskState::Cancelled) => return terminal,
        };
    }
}
