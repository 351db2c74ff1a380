//! Text dump format.
//!
//! A dump is a sequence of `;`-terminated SQL statements: a preamble, then for
//! every table a `DROP TABLE IF EXISTS`, its creation statement and a single
//! batched `INSERT` bracketed by `LOCK TABLES`/`UNLOCK TABLES`.
//!
//! String values are only escaped by doubling single quotes. Newlines and
//! backslashes are written verbatim, so a dump restored into an engine that
//! treats `\` as an escape character may alter such values.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::value::{Row, Value};

pub fn serialize_header(now: DateTime<Utc>) -> String {
    format!(
        "-- tablevault database dump\n\
         -- Created at: {}\n\
         \n\
         SET NAMES utf8mb4;\n\
         SET FOREIGN_KEY_CHECKS = 0;\n\
         \n",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub fn serialize_footer() -> String {
    "SET FOREIGN_KEY_CHECKS = 1;\n".to_owned()
}

pub fn serialize_table(table: &str, create_statement: &str, rows: &[Row]) -> String {
    let ident = quote_ident(table);
    let create = create_statement.trim().trim_end_matches(';');

    let mut out = format!(
        "-- Table structure for {ident}\n\
         DROP TABLE IF EXISTS {ident};\n\
         {create};\n\
         \n"
    );

    let Some(first) = rows.first() else {
        return out;
    };

    let columns: Vec<&str> = first.columns().collect();
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let tuples = rows
        .iter()
        .map(|row| {
            let values = columns
                .iter()
                .map(|c| row.get(c).map_or_else(|| "NULL".to_owned(), encode_value))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({values})")
        })
        .collect::<Vec<_>>()
        .join(",\n");

    out.push_str(&format!(
        "-- Data for {ident}\n\
         LOCK TABLES {ident} WRITE;\n\
         INSERT INTO {ident} ({column_list}) VALUES\n\
         {tuples};\n\
         UNLOCK TABLES;\n\
         \n"
    ));
    out
}

/// SQL literal for a value.
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(true) => "1".to_owned(),
        Value::Bool(false) => "0".to_owned(),
        Value::Int(i) => i.to_string(),
        // `Debug` keeps a fractional part or exponent, so `1.0` stays a float.
        Value::Float(f) if f.is_finite() => format!("{f:?}"),
        Value::Float(_) => "NULL".to_owned(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(b) => format!("X'{}'", hex::encode(b)),
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Breaks dump text into individually executable statements.
///
/// Quote-aware: a `;` inside `'...'`, `"..."` or `` `...` `` does not end a
/// statement, and a doubled quote character stays inside its literal. `--`
/// comments outside quotes are dropped, as are fragments left empty.
/// `/* ... */` comments are kept verbatim and never end a statement.
pub fn split_statements(dump: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = ScanState::Normal;
    let mut chars = dump.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            ScanState::Normal => match c {
                ';' => flush_statement(&mut current, &mut statements),
                '\'' | '"' | '`' => {
                    current.push(c);
                    state = ScanState::Quoted(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = ScanState::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    current.push_str("/*");
                    chars.next();
                    state = ScanState::BlockComment;
                }
                _ => current.push(c),
            },
            ScanState::Quoted(quote) => {
                current.push(c);
                if c == quote {
                    if chars.peek() == Some(&quote) {
                        current.push(quote);
                        chars.next();
                    } else {
                        state = ScanState::Normal;
                    }
                }
            }
            ScanState::LineComment => {
                if c == '\n' {
                    current.push('\n');
                    state = ScanState::Normal;
                }
            }
            ScanState::BlockComment => {
                current.push(c);
                if c == '*' && chars.peek() == Some(&'/') {
                    current.push('/');
                    chars.next();
                    state = ScanState::Normal;
                }
            }
        }
    }
    flush_statement(&mut current, &mut statements);
    statements
}

fn flush_statement(current: &mut String, statements: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_owned());
    }
    current.clear();
}
