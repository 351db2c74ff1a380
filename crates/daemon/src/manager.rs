use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tablevault_core::dump;
use tablevault_core::{content_hash, BackupConfig, BackupInfo, ContentHasher};
use tablevault_executor::QueryExecutor;
use tablevault_storage::{BackupStore, DumpWriter};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const LOGGED_STATEMENT_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup directory {0} does not exist; initialize the manager first")]
    NotInitialized(PathBuf),
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error("schedule interval must be greater than zero")]
    InvalidInterval,
}

/// Creates, restores, lists and expires full dumps of one relational store.
///
/// Create, restore and clean are serialized: whichever caller (CLI or
/// scheduler tick) gets the operation lock first runs to completion before
/// the next one starts.
pub struct BackupManager {
    config: BackupConfig,
    store: BackupStore,
    executor: Arc<dyn QueryExecutor>,
    op_lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(config: BackupConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        let store = BackupStore::new(config.output_dir.clone());
        Self {
            config,
            store,
            executor,
            op_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn store(&self) -> &BackupStore {
        &self.store
    }

    /// Creates the output directory if needed. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<()> {
        self.store.ensure_dir()?;
        info!(output_dir = %self.config.output_dir.display(), "backup directory ready");
        Ok(())
    }

    pub async fn create_full_backup(&self) -> Result<BackupInfo> {
        let _guard = self.op_lock.lock().await;
        self.ensure_ready()?;

        let now = Utc::now();
        let filename = self.unique_filename(now)?;
        let mut info = BackupInfo::started(filename, now);
        info!(backup_id = %info.id, filename = %info.filename, "starting full backup");

        match self.write_full_dump(&mut info).await {
            Ok(()) => {
                info!(
                    backup_id = %info.id,
                    filename = %info.filename,
                    size = info.size,
                    "backup completed"
                );
                Ok(info)
            }
            Err(e) => {
                info.fail();
                self.discard_partial(&info.filename);
                error!(
                    backup_id = %info.id,
                    filename = %info.filename,
                    error = %format!("{e:#}"),
                    "backup failed"
                );
                Err(e)
            }
        }
    }

    /// Replays a dump statement by statement. Stops at the first failing
    /// statement; statements already applied stay applied.
    pub async fn restore_from_backup(&self, filename: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.ensure_ready()?;
        if !self.store.exists(filename)? {
            return Err(BackupError::NotFound(filename.to_owned()).into());
        }

        let store = self.store.clone();
        let name = filename.to_owned();
        let text = tokio::task::spawn_blocking(move || store.read_dump(&name)).await??;
        self.check_content_hash(filename, &text);

        let statements = dump::split_statements(&text);
        info!(filename, statements = statements.len(), "restoring backup");

        for (index, statement) in statements.iter().enumerate() {
            if let Err(e) = self.executor.execute(statement).await {
                error!(
                    filename,
                    index,
                    statement = %truncate(statement, LOGGED_STATEMENT_CHARS),
                    error = %format!("{e:#}"),
                    "restore statement failed"
                );
                return Err(e);
            }
        }

        info!(filename, statements = statements.len(), "restore completed");
        Ok(())
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.ensure_ready()?;
        self.store.list()
    }

    /// Deletes backups older than the retention window and returns how many
    /// were removed. Individual deletion failures are logged and skipped.
    pub async fn clean_old_backups(&self) -> Result<usize> {
        let cutoff = retention_cutoff(Utc::now(), self.config.retention_days);
        self.clean_backups_older_than(cutoff).await
    }

    pub async fn clean_backups_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.op_lock.lock().await;
        self.ensure_ready()?;

        let mut removed = 0;
        for backup in self.store.list()? {
            if backup.created_at >= cutoff {
                continue;
            }
            match self.store.delete(&backup.filename) {
                Ok(()) => {
                    removed += 1;
                    info!(filename = %backup.filename, created_at = %backup.created_at, "removed expired backup");
                }
                Err(e) => warn!(
                    filename = %backup.filename,
                    error = %format!("{e:#}"),
                    "failed to remove expired backup"
                ),
            }
        }

        if removed > 0 {
            info!(removed, retention_days = self.config.retention_days, "retention cleanup finished");
        }
        Ok(removed)
    }

    async fn write_full_dump(&self, info: &mut BackupInfo) -> Result<()> {
        let compression = self.config.compression();
        let store = self.store.clone();
        let filename = info.filename.clone();
        let writer = tokio::task::spawn_blocking(move || store.create_dump(&filename, compression)).await??;
        let mut sink = DumpSink::new(writer)
            .emit(dump::serialize_header(info.created_at))
            .await?;

        let mut dumped = 0usize;
        let mut total_rows = 0usize;
        for table in self.executor.list_tables().await? {
            if self.config.is_excluded(&table) {
                debug!(table, "skipping excluded table");
                continue;
            }
            let create = self.executor.create_statement(&table).await?;
            let rows = self.executor.fetch_rows(&table).await?;
            sink = sink.emit(dump::serialize_table(&table, &create, &rows)).await?;
            debug!(table, rows = rows.len(), "table dumped");
            dumped += 1;
            total_rows += rows.len();
        }

        let sink = sink.emit(dump::serialize_footer()).await?;
        let store = self.store.clone();
        let filename = info.filename.clone();
        let (sha256, size) = tokio::task::spawn_blocking(move || -> Result<(String, u64)> {
            let sha256 = sink.finish()?;
            Ok((sha256, store.file_size(&filename)?))
        })
        .await??;

        info.set_meta("tables", dumped);
        info.set_meta("rows", total_rows);
        info.set_meta("compressed", compression.is_some());
        info.set_meta("compression", compression.map(|c| c.name()));
        info.set_meta(
            "excludedTables",
            self.config.exclude_tables.iter().cloned().collect::<Vec<_>>(),
        );
        info.set_meta("includeUploads", self.config.include_uploads);
        info.set_meta("sha256", sha256);
        info.complete(size);

        let store = self.store.clone();
        let record = info.clone();
        tokio::task::spawn_blocking(move || store.save_metadata(&record)).await?
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.store.is_ready() {
            return Err(BackupError::NotInitialized(self.config.output_dir.clone()).into());
        }
        Ok(())
    }

    fn unique_filename(&self, now: DateTime<Utc>) -> Result<String> {
        let stem = backup_stem(now);
        let ext = self.config.dump_extension();
        let mut candidate = format!("{stem}.{ext}");
        let mut n = 1;
        while self.store.exists(&candidate)? {
            candidate = format!("{stem}-{n}.{ext}");
            n += 1;
        }
        Ok(candidate)
    }

    fn discard_partial(&self, filename: &str) {
        match self.store.exists(filename) {
            Ok(true) => {
                if let Err(e) = self.store.delete(filename) {
                    warn!(filename, error = %format!("{e:#}"), "could not remove partial backup");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(filename, error = %format!("{e:#}"), "could not check for partial backup"),
        }
    }

    fn check_content_hash(&self, filename: &str, text: &str) {
        let Ok(meta) = self.store.load_metadata(filename) else {
            return;
        };
        if let Some(expected) = meta.meta_str("sha256") {
            let actual = content_hash(text.as_bytes());
            if expected != actual {
                warn!(filename, expected, actual = %actual, "dump content does not match recorded checksum");
            }
        }
    }
}

/// Dump writer that hashes the uncompressed text as it goes. Each chunk is
/// compressed and written on the blocking pool.
struct DumpSink {
    writer: DumpWriter,
    hasher: ContentHasher,
}

impl DumpSink {
    fn new(writer: DumpWriter) -> Self {
        Self {
            writer,
            hasher: ContentHasher::new(),
        }
    }

    async fn emit(mut self, text: String) -> Result<Self> {
        tokio::task::spawn_blocking(move || -> Result<Self> {
            self.hasher.update(text.as_bytes());
            self.writer.write_all(text.as_bytes()).context("write dump")?;
            Ok(self)
        })
        .await?
    }

    fn finish(self) -> Result<String> {
        self.writer.finish()?;
        Ok(self.hasher.finish())
    }
}

/// `backup_<unix millis>_<ISO time with ':' and '.' replaced>`.
fn backup_stem(now: DateTime<Utc>) -> String {
    let iso = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("backup_{}_{iso}", now.timestamp_millis())
}

/// A window reaching past the earliest representable time expires nothing.
fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(retention_days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn truncate(statement: &str, max_chars: usize) -> String {
    let mut chars = statement.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
