use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tablevault_core::{Row, Value};
use tracing::debug;

use crate::{ExecutorError, QueryExecutor};

/// SQLite-backed executor. One connection, so pragmas set by a dump's
/// preamble stay in effect for the statements that follow.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
    /// `foreign_keys` as it was before a dump switched enforcement off.
    foreign_keys_before: Arc<Mutex<Option<bool>>>,
}

impl SqliteExecutor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).with_context(|| format!("open sqlite db: {}", path.display()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            foreign_keys_before: Arc::new(Mutex::new(None)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait::async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = statement.to_owned();
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
            let mut rows = stmt.query(params_from_iter(params))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut converted = Row::new();
                for (i, name) in names.iter().enumerate() {
                    converted.push(name.clone(), from_value_ref(row.get_ref(i)?));
                }
                out.push(converted);
            }
            Ok(out)
        })
        .await
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        let translated = match translate(statement) {
            Translated::Skip => {
                debug!(statement, "skipping statement sqlite has no equivalent for");
                return Ok(0);
            }
            Translated::ForeignKeys(enabled) => {
                let before = self.foreign_keys_before.clone();
                return self
                    .with_conn(move |conn| {
                        let mut before = before
                            .lock()
                            .map_err(|_| anyhow!("foreign key state lock poisoned"))?;
                        let target = if enabled {
                            before.take().unwrap_or(true)
                        } else {
                            if before.is_none() {
                                let current: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                                *before = Some(current);
                            }
                            false
                        };
                        conn.pragma_update(None, "foreign_keys", target)?;
                        debug!(enabled = target, "foreign key enforcement set");
                        Ok(0)
                    })
                    .await;
            }
            Translated::Run => statement.to_owned(),
        };
        self.with_conn(move |conn| {
            let changed = conn.execute(&translated, [])?;
            Ok(changed as u64)
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn create_statement(&self, table: &str) -> Result<String> {
        let table = table.to_owned();
        self.with_conn(move |conn| {
            let sql = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&table],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            sql.ok_or_else(|| ExecutorError::UnknownTable(table).into())
        })
        .await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Translated {
    Run,
    Skip,
    /// `SET FOREIGN_KEY_CHECKS`. Turning checks back on restores whatever
    /// the connection had before they were turned off.
    ForeignKeys(bool),
}

/// Maps the MySQL session directives a dump carries onto sqlite.
fn translate(statement: &str) -> Translated {
    let head: String = statement
        .trim_start()
        .chars()
        .take(32)
        .collect::<String>()
        .to_ascii_uppercase();

    if head.starts_with("LOCK TABLES") || head.starts_with("UNLOCK TABLES") || head.starts_with("SET NAMES") {
        return Translated::Skip;
    }
    if let Some(rest) = head.strip_prefix("SET FOREIGN_KEY_CHECKS") {
        let value = rest.trim().trim_start_matches('=').trim();
        return Translated::ForeignKeys(value != "0");
    }
    Translated::Run
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}
