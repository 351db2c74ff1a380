use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::Connection;
use tablevault_core::{content_hash, BackupConfig, BackupInfo, BackupStatus, CompressionFormat, Row, Value};
use tablevault_daemon::{BackupError, BackupManager, BackupScheduler};
use tablevault_executor::{QueryExecutor, SqliteExecutor};

fn seed_db(path: &Path, sql: &str) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(sql).unwrap();
}

fn read_rows(path: &Path, sql: &str) -> Vec<(i64, Option<String>)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap()
}

fn table_exists(path: &Path, table: &str) -> bool {
    let conn = Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |r| r.get::<_, i64>(0),
    )
    .unwrap()
        > 0
}

fn config_for(dir: &Path) -> BackupConfig {
    BackupConfig {
        retention_days: 7,
        compression_enabled: true,
        ..BackupConfig::new(dir)
    }
}

fn manager_for(dir: &Path, db: &Path) -> BackupManager {
    let executor = Arc::new(SqliteExecutor::open(db).unwrap());
    let manager = BackupManager::new(config_for(dir), executor);
    manager.initialize().unwrap();
    manager
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

/// Wraps a real executor and fails when reading rows of one table.
struct FailOnTable {
    inner: SqliteExecutor,
    table: &'static str,
}

#[async_trait::async_trait]
impl QueryExecutor for FailOnTable {
    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(statement, params).await
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        self.inner.execute(statement).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.list_tables().await
    }

    async fn create_statement(&self, table: &str) -> Result<String> {
        self.inner.create_statement(table).await
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>> {
        if table == self.table {
            return Err(anyhow!("injected failure reading {table}"));
        }
        self.inner.fetch_rows(table).await
    }
}

/// In-memory store with one table; counts how many backups were attempted.
#[derive(Default)]
struct CountingExecutor {
    attempts: AtomicUsize,
    fail: bool,
}

#[async_trait::async_trait]
impl QueryExecutor for CountingExecutor {
    async fn query(&self, _statement: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn execute(&self, _statement: &str) -> Result<u64> {
        Ok(0)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("store unavailable"));
        }
        Ok(vec!["t".to_owned()])
    }

    async fn create_statement(&self, _table: &str) -> Result<String> {
        Ok("CREATE TABLE t (id INT)".to_owned())
    }

    async fn fetch_rows(&self, _table: &str) -> Result<Vec<Row>> {
        Ok(vec![Row::new().with("id", 1)])
    }
}

/// Backups that take longer than the schedule interval.
struct SlowExecutor {
    inner: CountingExecutor,
    delay: Duration,
}

#[async_trait::async_trait]
impl QueryExecutor for SlowExecutor {
    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.inner.query(statement, params).await
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        self.inner.execute(statement).await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_tables().await
    }

    async fn create_statement(&self, table: &str) -> Result<String> {
        self.inner.create_statement(table).await
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>> {
        self.inner.fetch_rows(table).await
    }
}

#[tokio::test]
async fn test_gzip_backup_and_restore_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(
        &source,
        "CREATE TABLE t (id INT, name TEXT);
         INSERT INTO t VALUES (1, 'a'), (2, 'b');",
    );

    let manager = manager_for(&out, &source);
    let info = manager.create_full_backup().await.unwrap();

    assert!(info.filename.starts_with("backup_"));
    assert!(info.filename.ends_with(".sql.gz"));
    assert_eq!(info.status, BackupStatus::Completed);
    assert!(info.size > 0);
    assert!(out.join(&info.filename).exists());
    assert_eq!(
        std::fs::metadata(out.join(&info.filename)).unwrap().len(),
        info.size
    );

    let sidecar: BackupInfo = serde_json::from_str(
        &std::fs::read_to_string(out.join(format!("{}.meta.json", info.filename))).unwrap(),
    )
    .unwrap();
    assert_eq!(sidecar, info);
    assert_eq!(sidecar.metadata["tables"], 1);
    assert_eq!(sidecar.metadata["rows"], 2);
    assert_eq!(sidecar.metadata["compression"], "gzip");
    let text = manager.store().read_dump(&info.filename).unwrap();
    assert_eq!(sidecar.meta_str("sha256"), Some(content_hash(text.as_bytes()).as_str()));

    let target = tmp.path().join("target.db");
    seed_db(&target, "CREATE TABLE t (id INT, name TEXT);");
    let restorer = manager_for(&out, &target);
    restorer.restore_from_backup(&info.filename).await.unwrap();

    assert_eq!(
        read_rows(&target, "SELECT id, name FROM t ORDER BY id"),
        vec![(1, Some("a".to_owned())), (2, Some("b".to_owned()))]
    );
}

#[tokio::test]
async fn test_round_trip_preserves_awkward_values() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(
        &source,
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);
         INSERT INTO notes VALUES
           (1, 'it''s; tricky'),
           (2, 'line one
line two -- not a comment'),
           (3, NULL),
           (4, '');
         CREATE TABLE empty (id INTEGER);
         CREATE TABLE sessions (id INTEGER, token TEXT);
         INSERT INTO sessions VALUES (1, 'secret');",
    );

    let mut config = config_for(&out);
    config.compression_format = CompressionFormat::Zstd;
    config.exclude_tables.insert("sessions".to_owned());
    let manager = BackupManager::new(config, Arc::new(SqliteExecutor::open(&source).unwrap()));
    manager.initialize().unwrap();

    let info = manager.create_full_backup().await.unwrap();
    assert!(info.filename.ends_with(".sql.zst"));
    assert_eq!(info.metadata["tables"], 2);

    let text = manager.store().read_dump(&info.filename).unwrap();
    assert!(!text.contains("sessions"));
    assert!(text.contains("DROP TABLE IF EXISTS `empty`;"));

    let target = tmp.path().join("target.db");
    seed_db(&target, "CREATE TABLE placeholder (id INTEGER);");
    manager_for(&out, &target)
        .restore_from_backup(&info.filename)
        .await
        .unwrap();

    let query = "SELECT id, body FROM notes ORDER BY id";
    assert_eq!(read_rows(&target, query), read_rows(&source, query));
    assert!(table_exists(&target, "empty"));
    assert!(!table_exists(&target, "sessions"));
}

#[tokio::test]
async fn test_round_trip_keeps_integral_floats_real() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(
        &source,
        "CREATE TABLE m (id INTEGER, v);
         INSERT INTO m VALUES (1, 1.0), (2, 2.5), (3, 1e20);",
    );

    let manager = manager_for(&out, &source);
    let info = manager.create_full_backup().await.unwrap();

    let target = tmp.path().join("target.db");
    seed_db(&target, "CREATE TABLE placeholder (id INTEGER);");
    manager_for(&out, &target)
        .restore_from_backup(&info.filename)
        .await
        .unwrap();

    let types = "SELECT id, typeof(v) FROM m ORDER BY id";
    assert_eq!(
        read_rows(&target, types),
        vec![
            (1, Some("real".to_owned())),
            (2, Some("real".to_owned())),
            (3, Some("real".to_owned())),
        ]
    );
    let values = "SELECT id, CAST(v AS TEXT) FROM m ORDER BY id";
    assert_eq!(read_rows(&target, values), read_rows(&source, values));
}

#[tokio::test]
async fn test_round_trip_with_block_comment_in_schema() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(
        &source,
        "CREATE TABLE c (id INTEGER /* key; primary */, name TEXT);
         INSERT INTO c VALUES (1, 'x'), (2, 'y;z');",
    );

    let manager = manager_for(&out, &source);
    let info = manager.create_full_backup().await.unwrap();

    let target = tmp.path().join("target.db");
    seed_db(&target, "CREATE TABLE placeholder (id INTEGER);");
    manager_for(&out, &target)
        .restore_from_backup(&info.filename)
        .await
        .unwrap();

    let query = "SELECT id, name FROM c ORDER BY id";
    assert_eq!(read_rows(&target, query), read_rows(&source, query));
}

#[tokio::test]
async fn test_restore_leaves_foreign_key_setting_as_found() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(&source, "CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1);");

    let manager = manager_for(&out, &source);
    let info = manager.create_full_backup().await.unwrap();

    let target = SqliteExecutor::open_in_memory().unwrap();
    let restorer = BackupManager::new(config_for(&out), Arc::new(target.clone()));
    restorer.restore_from_backup(&info.filename).await.unwrap();

    let rows = target.query("PRAGMA foreign_keys", &[]).await.unwrap();
    assert_eq!(rows[0].get("foreign_keys"), Some(&Value::Int(0)));
    assert_eq!(target.fetch_rows("t").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_uncompressed_backup_is_plain_sql() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(&source, "CREATE TABLE t (id INT, name TEXT); INSERT INTO t VALUES (1, 'a');");

    let mut config = config_for(&out);
    config.compression_enabled = false;
    let manager = BackupManager::new(config, Arc::new(SqliteExecutor::open(&source).unwrap()));
    manager.initialize().unwrap();

    let info = manager.create_full_backup().await.unwrap();
    assert!(info.filename.ends_with(".sql"));
    let raw = std::fs::read_to_string(out.join(&info.filename)).unwrap();
    assert!(raw.contains("INSERT INTO `t` (`id`, `name`) VALUES"));
    assert_eq!(info.metadata["compressed"], false);
}

#[tokio::test]
async fn test_failure_on_second_table_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let source = tmp.path().join("source.db");
    seed_db(
        &source,
        "CREATE TABLE a (id INTEGER); INSERT INTO a VALUES (1);
         CREATE TABLE b (id INTEGER); INSERT INTO b VALUES (2);",
    );

    let executor = FailOnTable {
        inner: SqliteExecutor::open(&source).unwrap(),
        table: "b",
    };
    let manager = BackupManager::new(config_for(&out), Arc::new(executor));
    manager.initialize().unwrap();

    let err = manager.create_full_backup().await.unwrap_err();
    assert_eq!(err.to_string(), "injected failure reading b");
    assert!(dir_entries(&out).is_empty());
    assert!(manager.list_backups().unwrap().is_empty());
}

#[tokio::test]
async fn test_restore_stops_at_first_failing_statement() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let db = tmp.path().join("db.sqlite");
    seed_db(&db, "CREATE TABLE keep (id INTEGER);");

    let manager = manager_for(&out, &db);
    manager
        .store()
        .write(
            "handmade.sql",
            "CREATE TABLE first (id INTEGER);\n\
             INSERT INTO first VALUES (1);\n\
             INSERT INTO missing_table VALUES (1);\n\
             CREATE TABLE never (id INTEGER);\n",
            None,
        )
        .unwrap();

    let err = manager.restore_from_backup("handmade.sql").await.unwrap_err();
    assert!(format!("{err:#}").contains("missing_table"));

    assert!(table_exists(&db, "first"));
    assert_eq!(read_rows(&db, "SELECT id, NULL FROM first"), vec![(1, None)]);
    assert!(!table_exists(&db, "never"));
}

#[tokio::test]
async fn test_restore_unknown_file_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let db = tmp.path().join("db.sqlite");
    seed_db(&db, "CREATE TABLE t (id INTEGER);");
    let manager = manager_for(&tmp.path().join("b"), &db);

    let err = manager.restore_from_backup("nope.sql.gz").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackupError>(),
        Some(BackupError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_operations_fail_fast_before_initialize() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("not-yet");
    let manager = BackupManager::new(config_for(&out), Arc::new(CountingExecutor::default()));

    let err = manager.create_full_backup().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackupError>(),
        Some(BackupError::NotInitialized(_))
    ));
    assert!(manager.list_backups().is_err());
    assert!(!out.exists());

    manager.initialize().unwrap();
    manager.initialize().unwrap();
    manager.create_full_backup().await.unwrap();
    assert_eq!(manager.list_backups().unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_is_newest_first_and_stable() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let manager = BackupManager::new(config_for(&out), Arc::new(CountingExecutor::default()));
    manager.initialize().unwrap();

    let first = manager.create_full_backup().await.unwrap();
    let second = manager.create_full_backup().await.unwrap();
    assert_ne!(first.filename, second.filename);

    let listed = manager.list_backups().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].created_at >= listed[1].created_at);
    assert_eq!(listed, manager.list_backups().unwrap());
}

#[tokio::test]
async fn test_retention_keeps_only_recent_backups() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let manager = BackupManager::new(config_for(&out), Arc::new(CountingExecutor::default()));
    manager.initialize().unwrap();

    let now = Utc::now();
    for (name, age_days) in [("old.sql", 10), ("mid.sql", 5), ("new.sql", 1)] {
        manager.store().write(name, "SELECT 1;", None).unwrap();
        let mut info = BackupInfo::started(name.to_owned(), now - chrono::Duration::days(age_days));
        info.complete(9);
        manager.store().save_metadata(&info).unwrap();
    }

    let removed = manager.clean_old_backups().await.unwrap();
    assert_eq!(removed, 1);

    let names: Vec<String> = manager
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|b| b.filename)
        .collect();
    assert_eq!(names, ["new.sql", "mid.sql"]);
    assert!(!out.join("old.sql.meta.json").exists());
}

#[tokio::test]
async fn test_cleanup_keeps_backup_exactly_at_cutoff() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let manager = BackupManager::new(config_for(&out), Arc::new(CountingExecutor::default()));
    manager.initialize().unwrap();

    let cutoff = Utc::now() - chrono::Duration::days(7);
    manager.store().write("edge.sql", "SELECT 1;", None).unwrap();
    let mut info = BackupInfo::started("edge.sql".to_owned(), cutoff);
    info.complete(9);
    manager.store().save_metadata(&info).unwrap();

    assert_eq!(manager.clean_backups_older_than(cutoff).await.unwrap(), 0);
    assert_eq!(manager.list_backups().unwrap().len(), 1);
}

#[tokio::test]
async fn test_huge_retention_window_expires_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let mut config = config_for(&out);
    config.retention_days = u32::MAX;
    let manager = BackupManager::new(config, Arc::new(CountingExecutor::default()));
    manager.initialize().unwrap();

    manager.store().write("ancient.sql", "SELECT 1;", None).unwrap();
    let mut info = BackupInfo::started("ancient.sql".to_owned(), Utc::now() - chrono::Duration::days(3650));
    info.complete(9);
    manager.store().save_metadata(&info).unwrap();

    assert_eq!(manager.clean_old_backups().await.unwrap(), 0);
    assert_eq!(manager.list_backups().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cleanup_skips_entries_it_cannot_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let manager = BackupManager::new(config_for(&out), Arc::new(CountingExecutor::default()));
    manager.initialize().unwrap();

    for name in ["a.sql", "b.sql", "stuck.sql"] {
        manager.store().write(name, "SELECT 1;", None).unwrap();
    }
    // A directory where the sidecar should be cannot be removed as a file.
    std::fs::create_dir(out.join("stuck.sql.meta.json")).unwrap();
    std::fs::write(out.join("stuck.sql.meta.json").join("keep"), "x").unwrap();

    let removed = manager
        .clean_backups_older_than(Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();

    assert_eq!(removed, 2);
    assert!(!out.join("a.sql").exists());
    assert!(!out.join("b.sql").exists());
    assert!(out.join("stuck.sql.meta.json").is_dir());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_overrunning_tick_prevents_further_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let executor = Arc::new(SlowExecutor {
        inner: CountingExecutor::default(),
        delay: Duration::from_secs(2 * 3600),
    });
    let manager = Arc::new(BackupManager::new(config_for(&out), executor.clone()));
    manager.initialize().unwrap();

    let scheduler = BackupScheduler::new(manager.clone());
    scheduler.schedule_backups(Duration::from_secs(3600)).unwrap();

    tokio::time::sleep(Duration::from_secs(3600 + 60)).await;
    assert_eq!(executor.inner.attempts.load(Ordering::SeqCst), 0);
    scheduler.stop_scheduled_backups();

    tokio::time::sleep(Duration::from_secs(10 * 3600)).await;
    assert_eq!(executor.inner.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(manager.list_backups().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rescheduling_keeps_a_single_timer() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let executor = Arc::new(CountingExecutor::default());
    let manager = Arc::new(BackupManager::new(config_for(&out), executor.clone()));
    manager.initialize().unwrap();

    let scheduler = BackupScheduler::new(manager.clone());
    scheduler.schedule_backups(Duration::from_secs(3600)).unwrap();
    scheduler.schedule_backups(Duration::from_secs(3600)).unwrap();
    assert!(scheduler.is_active());

    tokio::time::sleep(Duration::from_secs(3600 + 1)).await;
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(manager.list_backups().unwrap().len(), 1);

    scheduler.stop_scheduled_backups();
    scheduler.stop_scheduled_backups();
    assert!(!scheduler.is_active());

    tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ticks_do_not_stop_the_timer() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let executor = Arc::new(CountingExecutor {
        fail: true,
        ..CountingExecutor::default()
    });
    let manager = Arc::new(BackupManager::new(config_for(&out), executor.clone()));
    manager.initialize().unwrap();

    let scheduler = BackupScheduler::new(manager.clone());
    scheduler.schedule_backups(Duration::from_secs(3600)).unwrap();

    tokio::time::sleep(Duration::from_secs(3 * 3600 + 1)).await;
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 3);
    assert!(scheduler.is_active());
    assert!(dir_entries(&out).is_empty());

    scheduler.shutdown().await;
    assert!(!scheduler.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_timer_only_prunes() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("b");
    let executor = Arc::new(CountingExecutor::default());
    let manager = Arc::new(BackupManager::new(config_for(&out), executor.clone()));
    manager.initialize().unwrap();

    manager.store().write("ancient.sql", "SELECT 1;", None).unwrap();
    let mut info = BackupInfo::started("ancient.sql".to_owned(), Utc::now() - chrono::Duration::days(30));
    info.complete(9);
    manager.store().save_metadata(&info).unwrap();

    let scheduler = BackupScheduler::new(manager.clone());
    scheduler.schedule_cleanup(Duration::from_secs(24 * 3600)).unwrap();
    assert!(scheduler.is_cleanup_active());
    assert!(!scheduler.is_active());

    tokio::time::sleep(Duration::from_secs(24 * 3600 + 1)).await;
    assert!(manager.list_backups().unwrap().is_empty());
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_zero_interval_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = Arc::new(BackupManager::new(
        config_for(tmp.path()),
        Arc::new(CountingExecutor::default()),
    ));
    let scheduler = BackupScheduler::new(manager);
    let err = scheduler.schedule_backups(Duration::ZERO).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackupError>(),
        Some(BackupError::InvalidInterval)
    ));
    assert!(!scheduler.is_active());
}
