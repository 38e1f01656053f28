//! `veritrail healthcheck` — test every registered collector.

use std::path::Path;

use anyhow::{Result, bail};

use super::{build_registry, load_config, runtime};

/// Runs each collector's healthcheck and reports the results.
pub fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = build_registry(&config)?;

    let rt = runtime()?;
    let results = rt.block_on(registry.healthcheck_all());

    if results.is_empty() {
        bail!("no collectors registered; check credentials and docs_dir in the config");
    }

    let mut failures = 0;
    for (source_id, display_name, healthy) in &results {
        let status = if *healthy { "ok" } else { "FAILED" };
        println!("  {source_id:<20} {display_name:<24} {status}");
        if !healthy {
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} collector(s) failed their healthcheck");
    }
    println!("\nAll collectors healthy.");
    Ok(())
}
