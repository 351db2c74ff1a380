pub mod backup;
pub mod config;
pub mod dump;
pub mod hash;
pub mod value;

pub use backup::{BackupInfo, BackupKind, BackupStatus};
pub use config::{BackupConfig, CompressionFormat};
pub use hash::{content_hash, ContentHasher};
pub use value::{Row, Value};
