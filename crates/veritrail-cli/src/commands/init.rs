//! `veritrail init` — configuration and credential setup.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::SecretString;

use veritrail_core::collector::DirectoryApi;
use veritrail_core::config::{self, Config};
use veritrail_core::ledger::Ledger;

use crate::platform::GraphClient;

use super::runtime;

/// Environment variable consulted for the client secret before prompting.
const SECRET_ENV: &str = "VERITRAIL_CLIENT_SECRET";

/// Sets up configuration, stores the client secret in the OS keyring,
/// initialises the evidence store, and tests platform connectivity.
pub fn run(
    config_path: &Path,
    tenant_id: Option<String>,
    client_id: Option<String>,
) -> Result<()> {
    println!("veritrail setup");
    println!("You'll need a directory-platform app registration with application permissions.\n");

    let mut config = Config::from_file(config_path).unwrap_or_default();

    config.tenant_id = match tenant_id {
        Some(id) => id,
        None => prompt("Tenant ID")?,
    };
    config.client_id = match client_id {
        Some(id) => id,
        None => prompt("Application (client) ID")?,
    };

    let secret = match std::env::var(SECRET_ENV) {
        Ok(value) if !value.is_empty() => {
            println!("Using client secret from ${SECRET_ENV}.");
            SecretString::from(value)
        }
        _ => SecretString::from(prompt("Client secret value")?),
    };
    config::store_client_secret(&config.client_id, &secret)?;

    config.save(config_path)?;

    // Create the evidence store up front so the first collect can't fail
    // on a missing directory.
    Ledger::open(&config.database_path, &config.evidence_dir)
        .context("failed to initialise evidence store")?;

    println!("\nConfiguration saved.");
    println!("  Config:   {}", config_path.display());
    println!("  Evidence: {}", config.evidence_dir.display());
    println!("  Database: {}", config.database_path.display());

    println!("\nTesting connection to the directory platform...");
    let client = Arc::new(
        GraphClient::new(&config.tenant_id, &config.client_id, secret)
            .context("failed to build directory platform client")?,
    );
    let rt = runtime()?;
    if rt.block_on(client.test_connection()) {
        println!("  Authentication successful.");
    } else {
        println!("  Authentication FAILED.");
        println!("  You can still use veritrail — fix the credentials and run 'veritrail init' again.");
    }
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    std::io::stdout().flush().context("failed to flush stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read input")?;
    Ok(line.trim().to_string())
}
