use crate::error::{CheckError, Result};
use crate::types::LATENCY_UNMEASURED;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::info;

/// 备份文件 (如果有)
/// 文件名格式: original.ext -> original.ext.bak.TIMESTAMP (毫秒)
pub async fn backup_file(path: &Path) -> Result<()> {
    if fs::try_exists(path).await.unwrap_or(false) {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let file_name = path.file_name().unwrap_or_default().to_string_lossy();
        let backup_name = format!("{}.bak.{}", file_name, timestamp);
        let backup_path = path.with_file_name(backup_name);

        fs::copy(path, &backup_path).await?;
        info!("Backup created at: {:?}", backup_path);
    }
    Ok(())
}

/// 恢复到最近的备份
pub async fn restore_latest_backup(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let prefix = format!("{}.bak.", file_name);

    if !fs::try_exists(parent).await.unwrap_or(false) {
        return Err(CheckError::Custom(format!(
            "Directory not found: {:?}",
            parent
        )));
    }

    let mut entries = fs::read_dir(parent).await?;
    let mut backups = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stamp) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u128>().ok()) {
            backups.push((stamp, entry.path()));
        }
    }

    // Get the latest timestamp
    let (_, latest) = backups
        .into_iter()
        .max()
        .ok_or_else(|| CheckError::Custom("No backup files found.".to_string()))?;

    info!("Restoring from backup: {:?}", latest);
    fs::copy(&latest, path).await?;

    Ok(())
}

/// 每轮探测的进度条
pub fn round_progress() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("[{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("|| "));
    }
    pb
}

pub fn format_latency(ms: f64) -> String {
    if ms >= LATENCY_UNMEASURED as f64 {
        "Timeout".to_string()
    } else {
        format!("{:.0}ms", ms)
    }
}

/// 字节/秒 -> MB/s
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{:.2}MB/s", bytes_per_sec / 1024.0 / 1024.0)
}
