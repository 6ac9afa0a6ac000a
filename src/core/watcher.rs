//! Change notifications for a single document on disk

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::file_system::is_temp_file;

/// Live subscription to write notifications for one file.
///
/// Delivery stops only through [`WatchHandle::cancel`] (or dropping the handle).
pub struct WatchHandle {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    cancelled: Arc<AtomicBool>,
}

impl WatchHandle {
    /// The watched file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether notifications can still be delivered
    pub fn is_active(&self) -> bool {
        self.watcher.is_some() && !self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop delivery and release the OS handle; calling it again is a no-op
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.watcher.take().is_some() {
            tracing::debug!(path = %self.path.display(), "Stopped watching");
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watch `path` and call `on_change` whenever it is written.
///
/// The parent directory is observed so that rename-based saves are seen.
/// Rapid writes may be reported once or several times, and a notification
/// can arrive before the write it reports is visible. If the path cannot be
/// watched, the returned handle is inert and never fires.
pub fn watch<F>(path: &Path, on_change: F) -> WatchHandle
where
    F: Fn() + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let watcher = match start(path, on_change, cancelled.clone()) {
        Ok(watcher) => {
            tracing::debug!(path = %path.display(), "Watching for external changes");
            Some(watcher)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not watch file, external changes will go unnoticed");
            None
        }
    };

    WatchHandle {
        path: path.to_path_buf(),
        watcher,
        cancelled,
    }
}

fn start<F>(path: &Path, on_change: F, cancelled: Arc<AtomicBool>) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let target_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| notify::Error::generic("path has no file name"))?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        match res {
            Ok(event) => {
                if is_write(&event.kind)
                    && event.paths.iter().any(|p| {
                        !is_temp_file(p) && p.file_name() == Some(target_name.as_os_str())
                    })
                {
                    on_change();
                }
            }
            Err(e) => tracing::warn!(error = %e, "File watcher error"),
        }
    })?;

    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn is_write(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) => true,
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn channel_watch(path: &Path) -> (WatchHandle, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = watch(path, move || {
            let _ = tx.send(());
        });
        (handle, rx)
    }

    #[tokio::test]
    async fn test_reports_writes_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "one").unwrap();

        let (handle, mut rx) = channel_watch(&path);
        assert!(handle.is_active());

        std::fs::write(&path, "two").unwrap();
        let fired = timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(fired, Ok(Some(()))));
    }

    #[tokio::test]
    async fn test_ignores_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "one").unwrap();

        let (_handle, mut rx) = channel_watch(&path);
        std::fs::write(dir.path().join("b.md"), "other").unwrap();

        let fired = timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "one").unwrap();

        let (mut handle, mut rx) = channel_watch(&path);
        handle.cancel();
        handle.cancel();
        assert!(!handle.is_active());

        std::fs::write(&path, "two").unwrap();
        // The callback (and its sender) is dropped with the watcher.
        let fired = timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(!matches!(fired, Ok(Some(()))));
    }

    #[test]
    fn test_unwatchable_path_is_inert() {
        let handle = watch(Path::new("/folio/does/not/exist/a.md"), || {});
        assert!(!handle.is_active());
    }
}
