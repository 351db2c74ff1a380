use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    #[default]
    Gzip,
    Zstd,
}

impl CompressionFormat {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "gz",
            CompressionFormat::Zstd => "zst",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionFormat::Gzip => "gzip",
            CompressionFormat::Zstd => "zstd",
        }
    }
}

/// Settings the backup manager is constructed with. Never mutated afterwards.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub output_dir: PathBuf,
    pub retention_days: u32,
    pub compression_enabled: bool,
    pub compression_format: CompressionFormat,
    /// Reserved for non-database assets; only recorded in backup metadata.
    pub include_uploads: bool,
    pub exclude_tables: BTreeSet<String>,
}

impl BackupConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// The compressor new dumps go through, if any.
    pub fn compression(&self) -> Option<CompressionFormat> {
        self.compression_enabled.then_some(self.compression_format)
    }

    /// File extension for new dumps: `sql`, `sql.gz` or `sql.zst`.
    pub fn dump_extension(&self) -> String {
        match self.compression() {
            Some(format) => format!("sql.{}", format.extension()),
            None => "sql".to_owned(),
        }
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        self.exclude_tables.contains(table)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./backups"),
            retention_days: 30,
            compression_enabled: true,
            compression_format: CompressionFormat::Gzip,
            include_uploads: false,
            exclude_tables: BTreeSet::new(),
        }
    }
}
