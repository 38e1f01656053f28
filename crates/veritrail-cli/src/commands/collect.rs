//! `veritrail collect` — run evidence collection.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use veritrail_core::evidence::ComplianceStatus;
use veritrail_core::orchestrator::{CancelFlag, Orchestrator};

use super::{build_registry, load_config, load_framework, open_ledger, runtime};

/// Runs collection, or prints the task plan in dry-run mode.
pub fn run(
    config_path: &Path,
    controls: &[String],
    dry_run: bool,
    jobs: Option<usize>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let framework = load_framework(&config)?;

    for control in controls {
        if framework.control(control).is_none() {
            warn!(control, "control not in framework mapping; ignoring");
        }
    }
    let targets = if controls.is_empty() {
        None
    } else {
        Some(controls)
    };

    let mut policy = config.collection.clone();
    if let Some(jobs) = jobs {
        policy.max_concurrency = jobs;
    }

    let registry = build_registry(&config)?;
    let ledger = open_ledger(&config)?;
    let orchestrator = Orchestrator::new(registry, ledger, policy);

    if dry_run {
        let plan = orchestrator
            .plan(&framework, targets)
            .context("failed to plan collection")?;
        println!("Dry run — {} task(s) would be dispatched:", plan.len());
        let mut current_control = None::<&str>;
        for task in &plan {
            if current_control != Some(task.control_id.as_str()) {
                current_control = Some(task.control_id.as_str());
                println!("  {}: {}", task.control_id, task.control_name);
            }
            let marker = if task.collector_registered {
                ""
            } else {
                "  [collector not registered]"
            };
            println!(
                "    - {} via {} ({}){}",
                task.task_id, task.source, task.endpoint, marker
            );
        }
        return Ok(());
    }

    let cancel = CancelFlag::new();
    let rt = runtime()?;
    let summary = rt.block_on(async {
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling: waiting for in-flight tasks...");
                signal_cancel.cancel();
            }
        });
        orchestrator.run(&framework, targets, &cancel).await
    })?;

    println!(
        "Collection complete: {} task(s) in {:.1}s",
        summary.total_tasks,
        summary.elapsed.as_secs_f64()
    );
    for outcome in &summary.outcomes {
        println!(
            "  [{}] {} {} — {}",
            outcome.control_id, outcome.task_id, outcome.status, outcome.note
        );
    }
    println!();
    for (status, count) in &summary.status_counts {
        println!("  {status}: {count}");
    }

    if summary.count(ComplianceStatus::CollectionError) > 0 {
        eprintln!(
            "\n{} task(s) failed to collect; the failures are recorded in the ledger.",
            summary.count(ComplianceStatus::CollectionError)
        );
    }
    Ok(())
}
