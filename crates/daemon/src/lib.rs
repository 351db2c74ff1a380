pub mod config;
pub mod display;
pub mod manager;
pub mod scheduler;

pub use manager::{BackupError, BackupManager};
pub use scheduler::BackupScheduler;
