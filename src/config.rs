use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::buffer::BufferConfig;
use crate::cli::Cli;
use crate::pipeline::DetectionConfig;
use crate::redetect::RedetectConfig;

pub const DB_ENV_VAR: &str = "FILE_KIND_DB";

/// Engine tuning, loadable from a JSON file. Every field has a default so
/// a partial file is fine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detection: DetectionConfig,
    pub buffer: BufferConfig,
    pub redetect: RedetectConfig,
    /// Semicolon separated ignore masks replacing the defaults.
    pub ignore_masks: Option<String>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }
}

pub fn resolve_config(cli: &Cli) -> Result<EngineConfig> {
    match cli.config.as_deref() {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    }
}

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(DB_ENV_VAR)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    Ok(engine_home()?.join("db.lmdb"))
}

pub fn clear_db(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "db")?;
    remove_file_if_exists(&lmdb_lock_path(db_path), "db lock")?;
    Ok(())
}

fn engine_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("file-kind"))
}

pub(crate) fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
