//! `veritrail gaps` — controls that are not fully compliant.

use std::path::Path;

use anyhow::Result;

use veritrail_core::report::ComplianceReport;

use super::{load_config, load_framework, open_ledger};

/// Prints the gap report as a table or JSON.
pub fn run(config_path: &Path, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let framework = load_framework(&config)?;
    let ledger = open_ledger(&config)?;

    let report = ComplianceReport::build(&ledger, &framework)?;
    let gaps = report.gaps();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&gaps)?);
        return Ok(());
    }

    println!("Compliance Gap Report — {}", report.framework);
    println!("{}", "=".repeat(72));

    if gaps.is_empty() {
        println!("  No gaps found — all controls compliant.");
        return Ok(());
    }

    for entry in &gaps {
        let collected = entry
            .collected_at
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d").to_string());
        println!(
            "  {:<10} {:<18} {:<9} {}",
            entry.control_id, entry.status, entry.severity, entry.name
        );
        println!("  {:<10} {} (collected: {collected})", "", entry.note);
    }
    println!("\n  {} gap(s) identified.", gaps.len());
    Ok(())
}
