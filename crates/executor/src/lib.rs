use std::sync::Arc;

use anyhow::Result;
use tablevault_core::dump::quote_ident;
use tablevault_core::{Row, Value};
use thiserror::Error;

pub mod mysql;
pub mod sqlite;

pub use mysql::MysqlExecutor;
pub use sqlite::SqliteExecutor;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unsupported database url: {0} (expected sqlite: or mysql:)")]
    UnsupportedUrl(String),
    #[error("table does not exist: {0}")]
    UnknownTable(String),
}

/// The narrow window onto the relational store that backups go through.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a row-returning statement with positional parameters.
    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Runs one statement and returns the affected row count.
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Names of all base tables.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// The statement that recreates `table`, without a trailing terminator.
    async fn create_statement(&self, table: &str) -> Result<String>;

    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>> {
        self.query(&format!("SELECT * FROM {}", quote_ident(table)), &[])
            .await
    }
}

/// Opens an executor for `sqlite://path`, `sqlite::memory:` or `mysql://...`.
pub async fn connect(url: &str) -> Result<Arc<dyn QueryExecutor>> {
    if url.starts_with("mysql://") {
        return Ok(Arc::new(MysqlExecutor::connect(url).await?));
    }
    if let Some(rest) = url.strip_prefix("sqlite:") {
        let path = rest.strip_prefix("//").unwrap_or(rest);
        let executor = if path == ":memory:" {
            SqliteExecutor::open_in_memory()?
        } else {
            SqliteExecutor::open(path)?
        };
        return Ok(Arc::new(executor));
    }
    Err(ExecutorError::UnsupportedUrl(url.to_owned()).into())
}
