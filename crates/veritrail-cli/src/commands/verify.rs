//! `veritrail verify` — walk every hash chain and report integrity.

use std::path::Path;

use anyhow::{Result, bail};

use veritrail_core::ledger::ChainStatus;

use super::{load_config, open_ledger};

/// Verifies the ledger's hash chains; exits non-zero on any break.
pub fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let ledger = open_ledger(&config)?;

    let report = ledger.verify()?;

    if report.chains.is_empty() {
        println!("Ledger is empty; nothing to verify.");
        return Ok(());
    }

    for (control_id, status) in &report.chains {
        match status {
            ChainStatus::Intact { length } => {
                println!("  {control_id}: intact ({length} record(s))");
            }
            ChainStatus::Broken { length, fault } => {
                let at = fault
                    .evidence_id
                    .as_deref()
                    .map_or_else(|| format!("position {}", fault.position), |id| {
                        format!("position {} ({id})", fault.position)
                    });
                println!(
                    "  {control_id}: BROKEN — {} at {at}: {} [{length} record(s) examined]",
                    fault.kind, fault.detail
                );
            }
        }
    }

    let broken = report.broken();
    if broken.is_empty() {
        println!("\nAll evidence integrity checks passed.");
        Ok(())
    } else {
        bail!("{} control chain(s) failed integrity verification", broken.len());
    }
}
