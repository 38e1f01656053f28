//! `veritrail report` — render the compliance evidence pack.

use std::path::Path;

use anyhow::{Context, Result};

use veritrail_core::report::ComplianceReport;

use super::{load_config, load_framework, open_ledger};

/// Generates the report into the output directory.
pub fn run(config_path: &Path, output: &Path, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let framework = load_framework(&config)?;
    let ledger = open_ledger(&config)?;

    let report = ComplianceReport::build(&ledger, &framework)?;

    std::fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;

    let html = format == "html";
    let file = output.join(if html {
        "evidence_pack.html"
    } else {
        "evidence_pack.json"
    });
    report.write_to(&file, html)?;

    println!(
        "Report written to {} ({} controls, {} compliant)",
        file.display(),
        report.totals.total_controls,
        report.totals.compliant
    );
    Ok(())
}
