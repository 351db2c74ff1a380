use chrono::{DateTime, Local, Utc};
use tablevault_core::BackupInfo;

pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

pub fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One line per backup for the `list` command.
pub fn backup_line(info: &BackupInfo) -> String {
    format!(
        "{}  {:>10}  {}",
        info.filename,
        format_size(info.size),
        format_local(info.created_at)
    )
}
