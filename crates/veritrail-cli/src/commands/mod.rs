//! CLI command implementations.

pub mod collect;
pub mod gaps;
pub mod healthcheck;
pub mod init;
pub mod report;
pub mod verify;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use veritrail_core::collector::{CollectorRegistry, DirectoryCollector, DocumentCollector, ManualCollector};
use veritrail_core::config::{self, Config};
use veritrail_core::ledger::Ledger;
use veritrail_core::mapping::{self, Framework};

use crate::platform::GraphClient;

/// Loads config with a pointer at `init` when missing.
fn load_config(config_path: &Path) -> Result<Config> {
    Config::from_file(config_path).with_context(|| {
        format!(
            "failed to load config from {}; run 'veritrail init' to create one",
            config_path.display()
        )
    })
}

/// Loads the framework mapping the config points at.
fn load_framework(config: &Config) -> Result<Framework> {
    mapping::load_framework(&config.mapping_path).with_context(|| {
        format!(
            "failed to load framework mapping from {}",
            config.mapping_path.display()
        )
    })
}

/// Opens the evidence ledger.
fn open_ledger(config: &Config) -> Result<Arc<Ledger>> {
    let ledger = Ledger::open(&config.database_path, &config.evidence_dir)
        .with_context(|| format!("failed to open ledger at {}", config.database_path.display()))?;
    Ok(Arc::new(ledger))
}

/// Builds the collector registry from the configuration: the directory
/// platform (when credentials are configured), manual evidence, and the
/// document collector (when a docs directory is configured).
fn build_registry(config: &Config) -> Result<Arc<CollectorRegistry>> {
    let mut registry = CollectorRegistry::new();
    registry.register(Arc::new(ManualCollector));

    if let Some(docs_dir) = &config.docs_dir {
        registry.register(Arc::new(DocumentCollector::new(docs_dir.clone())));
    }

    if config.has_platform_credentials() {
        let secret = config::load_client_secret(&config.client_id)?;
        let client = GraphClient::new(&config.tenant_id, &config.client_id, secret)
            .context("failed to build directory platform client")?;
        registry.register(Arc::new(
            DirectoryCollector::new(Arc::new(client)).with_redaction(config.redact_principals),
        ));
    }

    Ok(Arc::new(registry))
}

/// Builds the single-threaded runtime commands run their async work on.
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}
