use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tablevault_core::{BackupInfo, CompressionFormat};
use thiserror::Error;
use tracing::{debug, warn};

use crate::compression::{compression_for, is_dump_file, read_dump_text, DumpWriter};

const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid backup filename: {0:?}")]
    InvalidFilename(String),
}

/// Owns the backup directory: dump files plus their `.meta.json` sidecars.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create backup directory: {}", self.root.display()))
    }

    pub fn is_ready(&self) -> bool {
        self.root.is_dir()
    }

    pub fn dump_path(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    pub fn exists(&self, filename: &str) -> Result<bool> {
        Ok(self.dump_path(filename)?.is_file())
    }

    /// Opens `filename` for streamed writing; the caller must `finish()` it.
    pub fn create_dump(&self, filename: &str, compression: Option<CompressionFormat>) -> Result<DumpWriter> {
        let path = self.dump_path(filename)?;
        self.ensure_dir()?;
        DumpWriter::create(&path, compression)
    }

    /// Writes a complete dump in one go and returns its size on disk.
    pub fn write(&self, filename: &str, content: &str, compression: Option<CompressionFormat>) -> Result<u64> {
        let mut writer = self.create_dump(filename, compression)?;
        writer
            .write_all(content.as_bytes())
            .with_context(|| format!("write dump: {filename}"))?;
        writer.finish()?;
        self.file_size(filename)
    }

    pub fn file_size(&self, filename: &str) -> Result<u64> {
        let path = self.dump_path(filename)?;
        let meta = fs::metadata(&path).with_context(|| format!("stat dump file: {}", path.display()))?;
        Ok(meta.len())
    }

    pub fn read_dump(&self, filename: &str) -> Result<String> {
        let path = self.dump_path(filename)?;
        read_dump_text(&path, compression_for(filename))
    }

    pub fn save_metadata(&self, info: &BackupInfo) -> Result<()> {
        let path = self.sidecar_path(&info.filename)?;
        let raw = serde_json::to_string_pretty(info).context("serialize backup metadata")?;
        fs::write(&path, raw).with_context(|| format!("write backup metadata: {}", path.display()))?;
        Ok(())
    }

    pub fn load_metadata(&self, filename: &str) -> Result<BackupInfo> {
        let path = self.sidecar_path(filename)?;
        let raw = fs::read_to_string(&path).with_context(|| format!("read backup metadata: {}", path.display()))?;
        let info = serde_json::from_str(&raw).with_context(|| format!("parse backup metadata: {}", path.display()))?;
        Ok(info)
    }

    /// All dumps in the directory, newest first, ties broken by filename.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("read backup directory: {}", self.root.display()))?;

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.context("read backup directory entry")?;
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            if !is_dump_file(&filename) || !entry.path().is_file() {
                continue;
            }
            backups.push(self.describe(&filename)?);
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(backups)
    }

    /// Removes a dump and its sidecar. A sidecar that is already gone is fine.
    pub fn delete(&self, filename: &str) -> Result<()> {
        let path = self.dump_path(filename)?;
        fs::remove_file(&path).with_context(|| format!("delete dump file: {}", path.display()))?;

        let sidecar = self.sidecar_path(filename)?;
        match fs::remove_file(&sidecar) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete backup metadata: {}", sidecar.display())),
        }
    }

    fn describe(&self, filename: &str) -> Result<BackupInfo> {
        let sidecar = self.sidecar_path(filename)?;
        if sidecar.exists() {
            match self.load_metadata(filename) {
                // The dump on disk names the backup, whatever the sidecar says.
                Ok(mut info) => {
                    info.filename = filename.to_owned();
                    return Ok(info);
                }
                Err(e) => warn!(filename, error = %format!("{e:#}"), "unreadable backup metadata, using file attributes"),
            }
        } else {
            debug!(filename, "no metadata sidecar, using file attributes");
        }

        let path = self.root.join(filename);
        let meta = fs::metadata(&path).with_context(|| format!("stat dump file: {}", path.display()))?;
        let created = meta.created().or_else(|_| meta.modified()).context("read dump file time")?;
        Ok(BackupInfo::synthesized(
            filename.to_owned(),
            meta.len(),
            DateTime::<Utc>::from(created),
        ))
    }

    fn sidecar_path(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.root.join(format!("{filename}{SIDECAR_SUFFIX}")))
    }
}

fn validate_filename(filename: &str) -> Result<(), StoreError> {
    let bad = filename.is_empty()
        || filename == "."
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\');
    if bad {
        return Err(StoreError::InvalidFilename(filename.to_owned()));
    }
    Ok(())
}
