use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tablevault_core::{BackupConfig, CompressionFormat};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub backup: BackupSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupSection {
    pub output_dir: Option<String>,
    pub retention_days: Option<u32>,
    pub compression: Option<bool>,
    pub compression_format: Option<CompressionFormat>,
    pub include_uploads: Option<bool>,
    pub exclude_tables: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

/// `DATABASE_URL` wins over the config file.
pub fn database_url(cfg: &Config) -> Option<String> {
    env::var("DATABASE_URL").ok().or_else(|| cfg.database.url.clone())
}

/// Merges the file's `[backup]` section, environment overrides and defaults.
pub fn backup_config(cfg: &Config) -> Result<BackupConfig> {
    let defaults = BackupConfig::default();

    let output_dir = env::var("TABLEVAULT_OUTPUT_DIR")
        .ok()
        .or_else(|| cfg.backup.output_dir.clone())
        .map(PathBuf::from)
        .unwrap_or(defaults.output_dir);

    let retention_days = match env::var("TABLEVAULT_RETENTION_DAYS") {
        Ok(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("invalid TABLEVAULT_RETENTION_DAYS: {raw:?}"))?,
        Err(_) => cfg.backup.retention_days.unwrap_or(defaults.retention_days),
    };

    Ok(BackupConfig {
        output_dir,
        retention_days,
        compression_enabled: cfg.backup.compression.unwrap_or(defaults.compression_enabled),
        compression_format: cfg.backup.compression_format.unwrap_or(defaults.compression_format),
        include_uploads: cfg.backup.include_uploads.unwrap_or(defaults.include_uploads),
        exclude_tables: cfg.backup.exclude_tables.iter().cloned().collect::<BTreeSet<_>>(),
    })
}
