pub mod compression;
pub mod store;

pub use compression::{compression_for, DumpWriter};
pub use store::{BackupStore, StoreError};
