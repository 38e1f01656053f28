//! Configuration loading, saving, and validation.
//!
//! Configuration lives in a TOML file (default
//! `~/.veritrail/config.toml`). The directory-platform client secret is
//! never written there: it is held in the OS keyring and surfaces in
//! memory only as a [`SecretString`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::orchestrator::CollectionPolicy;

/// Keyring service name for stored secrets.
const KEYRING_SERVICE: &str = "veritrail";

/// Errors from configuration handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("config I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized.
    #[error("config serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The config is structurally valid but unusable.
    #[error("config validation failed: {0}")]
    Validation(String),

    /// The OS keyring rejected a secret operation.
    #[error("keyring error: {0}")]
    Keyring(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory-platform tenant identifier.
    #[serde(default)]
    pub tenant_id: String,

    /// Directory-platform application (client) identifier. Also the
    /// keyring account name the client secret is stored under.
    #[serde(default)]
    pub client_id: String,

    /// Directory for evidence artifacts.
    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: PathBuf,

    /// Path to the ledger database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Path to the framework mapping document.
    #[serde(default = "default_mapping_path")]
    pub mapping_path: PathBuf,

    /// Directory of policy/procedure documents for the document collector.
    #[serde(default)]
    pub docs_dir: Option<PathBuf>,

    /// Redact user principal names in summaries and reports.
    #[serde(default)]
    pub redact_principals: bool,

    /// Collection run policy.
    #[serde(default)]
    pub collection: CollectionPolicy,
}

/// Base configuration directory (`~/.veritrail`).
#[must_use]
pub fn config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".veritrail")
}

/// Default config file path.
#[must_use]
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn default_evidence_dir() -> PathBuf {
    config_dir().join("evidence")
}

fn default_database_path() -> PathBuf {
    config_dir().join("evidence.db")
}

fn default_mapping_path() -> PathBuf {
    config_dir().join("mappings/iso27001-2022.yaml")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            evidence_dir: default_evidence_dir(),
            database_path: default_database_path(),
            mapping_path: default_mapping_path(),
            docs_dir: None,
            redact_principals: false,
            collection: CollectionPolicy::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses configuration from a TOML string and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        let problems = config.validate();
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Validation(problems.join("; ")))
        }
    }

    /// Writes configuration to a TOML file, creating parent directories.
    /// On Unix the file is restricted to `0600` — it identifies the
    /// tenant even though it carries no secret.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        }

        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Validates the configuration, returning each problem found.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.collection.max_concurrency == 0 {
            problems.push("collection.max_concurrency must be at least 1".to_string());
        }
        if self.collection.max_attempts == 0 {
            problems.push("collection.max_attempts must be at least 1".to_string());
        }
        if self.collection.attempt_timeout < Duration::from_millis(1) {
            problems.push("collection.attempt_timeout must be positive".to_string());
        }
        problems
    }

    /// Whether the directory-platform credentials are configured.
    #[must_use]
    pub fn has_platform_credentials(&self) -> bool {
        !self.tenant_id.is_empty() && !self.client_id.is_empty()
    }
}

/// Stores the directory-platform client secret in the OS keyring.
///
/// # Errors
///
/// Returns an error if the keyring rejects the entry.
pub fn store_client_secret(client_id: &str, secret: &SecretString) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, client_id)
        .map_err(|e| ConfigError::Keyring(e.to_string()))?;
    entry
        .set_password(secret.expose_secret())
        .map_err(|e| ConfigError::Keyring(e.to_string()))?;
    info!(client_id, "client secret stored in keyring");
    Ok(())
}

/// Loads the directory-platform client secret from the OS keyring.
///
/// # Errors
///
/// Returns an error if no secret is stored or the keyring is unavailable.
pub fn load_client_secret(client_id: &str) -> Result<SecretString, ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, client_id)
        .map_err(|e| ConfigError::Keyring(e.to_string()))?;
    let secret = entry.get_password().map_err(|e| {
        ConfigError::Keyring(format!(
            "no client secret stored for '{client_id}': {e}; run 'veritrail init'"
        ))
    })?;
    Ok(SecretString::from(secret))
}
