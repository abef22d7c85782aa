//! Atomic file replacement.
//!
//! Both the known-users file and the thread snapshot are rewritten in
//! full. A crash mid-write must leave the previous version intact, so
//! the new contents go to a sibling temp file which is fsynced and then
//! renamed over the target.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Temp file used while replacing `path`: `.{name}.tmp` in the same dir.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("mintbot");
    path.with_file_name(format!(".{name}.tmp"))
}

/// Replace `path` with `contents` atomically.
///
/// Parent directories are created if missing.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let tmp = temp_path_for(path);
    let mut file = fs::File::create(&tmp)
        .await
        .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync temp file: {}", tmp.display()))?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).with_context(|| {
            format!("Failed to replace {} with {}", path.display(), tmp.display())
        });
    }

    Ok(())
}
