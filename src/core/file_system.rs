//! File system operations for reading and safely replacing documents

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;

use crate::error::{FolioError, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Read a document as UTF-8 text
pub async fn read_document(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FolioError::from_io(path, e))
}

/// Replace the contents of `path` atomically.
///
/// The content goes to a hidden sibling file first and is renamed over the
/// target, so readers never observe a half-written document.
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| FolioError::from_io(parent, e))?;

    let temp = temp_path_for(path);
    if let Err(e) = write_and_sync(&temp, content).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(FolioError::from_io(path, e));
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(FolioError::from_io(path, e));
    }

    tracing::debug!(path = %path.display(), bytes = content.len(), "Wrote document");
    Ok(())
}

/// Last modification time of `path`, if it exists and is readable
pub async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}

/// Whether `path` names a temp file produced by [`write_atomic`]
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.starts_with('.') && name.ends_with(".folio-tmp")
        })
        .unwrap_or(false)
}

async fn write_and_sync(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}-{}.folio-tmp", name, std::process::id(), seq))
}
