use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor as _, Row as _, TypeInfo};
use tablevault_core::dump::quote_ident;
use tablevault_core::{Row, Value};
use tokio::sync::Mutex;

use crate::{ExecutorError, QueryExecutor};

/// MySQL-backed executor.
///
/// Holds a single connection rather than a pool: a restore issues
/// `LOCK TABLES` and the inserts that follow must run in the same session.
pub struct MysqlExecutor {
    conn: Mutex<MySqlConnection>,
}

impl MysqlExecutor {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let conn = MySqlConnection::connect(database_url)
            .await
            .context("connect to mysql")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait::async_trait]
impl QueryExecutor for MysqlExecutor {
    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.conn.lock().await;
        let query = params
            .iter()
            .fold(sqlx::query(statement), |q, value| bind_value(q, value));
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(mysql_row_to_row).collect()
    }

    async fn execute(&self, statement: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        // Text protocol: LOCK TABLES cannot be prepared.
        let result = (&mut *conn).execute(sqlx::raw_sql(statement)).await?;
        Ok(result.rows_affected())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let rows = (&mut *conn)
            .fetch_all(sqlx::raw_sql("SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'"))
            .await
            .context("list tables")?;
        rows.iter()
            .map(|r| r.try_get_unchecked::<String, _>(0).map_err(anyhow::Error::from))
            .collect()
    }

    async fn create_statement(&self, table: &str) -> Result<String> {
        let mut conn = self.conn.lock().await;
        let sql = format!("SHOW CREATE TABLE {}", quote_ident(table));
        let row = (&mut *conn)
            .fetch_optional(sqlx::raw_sql(&sql))
            .await
            .with_context(|| format!("show create table {table}"))?
            .ok_or_else(|| ExecutorError::UnknownTable(table.to_owned()))?;
        Ok(row.try_get_unchecked::<String, _>(1)?)
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value.clone() {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Bytes(b) => query.bind(b),
    }
}

fn mysql_row_to_row(row: &MySqlRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let type_name = column.type_info().name().to_ascii_uppercase();
        let value = decode_column(row, column.ordinal(), &type_name)
            .with_context(|| format!("decode column {} ({type_name})", column.name()))?;
        out.push(column.name(), value);
    }
    Ok(out)
}

fn decode_column(row: &MySqlRow, i: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let value = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(i)?.into(),
        name if name.ends_with(" UNSIGNED") => match row.try_get::<Option<u64>, _>(i)? {
            Some(n) => i64::try_from(n).map_or_else(|_| Value::Text(n.to_string()), Value::Int),
            None => Value::Null,
        },
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row.try_get::<Option<i64>, _>(i)?.into(),
        "YEAR" => row.try_get_unchecked::<Option<i64>, _>(i)?.into(),
        "FLOAT" | "DOUBLE" => row.try_get::<Option<f64>, _>(i)?.into(),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(i)?
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.f").to_string())
            .into(),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(i)?
            .map(|d| d.format("%Y-%m-%d").to_string())
            .into(),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(i)?
            .map(|t| t.format("%H:%M:%S%.f").to_string())
            .into(),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" | "GEOMETRY" => {
            match row.try_get_unchecked::<Option<Vec<u8>>, _>(i)? {
                Some(bytes) => Value::Bytes(bytes),
                None => Value::Null,
            }
        }
        // DECIMAL, the text family, ENUM, SET and JSON all arrive as strings.
        _ => row.try_get_unchecked::<Option<String>, _>(i)?.into(),
    };
    Ok(value)
}
