use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    /// Reserved; nothing produces incremental dumps yet.
    Incremental,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Completed,
    Failed,
    InProgress,
}

/// One dump file in the output directory, persisted as its `.meta.json` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub status: BackupStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl BackupInfo {
    /// A fresh full backup that has not been written yet.
    pub fn started(filename: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            filename,
            size: 0,
            created_at,
            kind: BackupKind::Full,
            status: BackupStatus::InProgress,
            metadata: BTreeMap::new(),
        }
    }

    /// Stand-in for a dump file whose sidecar is missing or unreadable.
    pub fn synthesized(filename: String, size: u64, created_at: DateTime<Utc>) -> Self {
        let id = filename
            .split('.')
            .next()
            .unwrap_or(filename.as_str())
            .to_owned();
        let mut metadata = BTreeMap::new();
        metadata.insert("synthesized".to_owned(), serde_json::Value::Bool(true));
        Self {
            id,
            filename,
            size,
            created_at,
            kind: BackupKind::Full,
            status: BackupStatus::Completed,
            metadata,
        }
    }

    pub fn complete(&mut self, size: u64) {
        self.size = size;
        self.status = BackupStatus::Completed;
    }

    pub fn fail(&mut self) {
        self.status = BackupStatus::Failed;
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_owned(), value.into());
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}
