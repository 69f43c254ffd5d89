//! Operator configuration for the corral binary.
//!
//! The store URL resolves through a chain: `--database-url` flag, the
//! `SUPABASE_DB_URL` env var, the config file, then the local default.
//! The config file lives at `$CORRAL_CONFIG` when set, otherwise under
//! the platform config directory (`corral/config.toml`).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use corral_db::config::DbConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct FileConfig {
    pub store: StoreSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSection {
    /// PostgreSQL connection URL for the task/worker store.
    pub url: String,
}

/// Where the config file lives.
pub fn config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var("CORRAL_CONFIG") {
        return PathBuf::from(explicit);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("corral")
        .join("config.toml")
}

/// Read the config file if one exists.
///
/// Absence is not an error (the resolution chain falls through to the
/// default); a file that exists but does not parse is.
pub fn read_file_config() -> Result<Option<FileConfig>> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let parsed = toml::from_str(&contents)
        .with_context(|| format!("invalid config file at {}", path.display()))?;
    Ok(Some(parsed))
}

/// Write the config file, readable by the owner only (the URL carries
/// store credentials).
pub fn write_file_config(config: &FileConfig) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&path)
        .with_context(|| format!("failed to open {} for writing", path.display()))?;
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CorralConfig {
    pub db_config: DbConfig,
}

impl CorralConfig {
    /// Resolution order: CLI flag, `SUPABASE_DB_URL`, config file,
    /// default. A malformed config file surfaces as an error rather than
    /// being silently skipped.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let url = if let Some(flag) = cli_db_url {
            flag.to_owned()
        } else if let Ok(env) = std::env::var("SUPABASE_DB_URL") {
            env
        } else if let Some(file) = read_file_config()? {
            file.store.url
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };

        Ok(Self {
            db_config: DbConfig::new(url),
        })
    }
}
