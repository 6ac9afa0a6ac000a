//! Document sessions: one open, editable file kept in sync with disk
//!
//! Each session runs as a single task that owns the in-memory content. Edits,
//! watcher notifications and write completions are all funneled into that
//! task, so state transitions never interleave.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::config::SessionSettings;
use super::file_system;
use super::grants::GrantManager;
use super::watcher::{self, WatchHandle};
use crate::error::{joined, FolioError, Result};

/// Timing parameters of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Quiescence period after the last edit before writing
    pub debounce: Duration,
    /// Period after our own write during which change notifications are echoes
    pub grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionSettings::default().into()
    }
}

impl From<SessionSettings> for SessionConfig {
    fn from(settings: SessionSettings) -> Self {
        Self {
            debounce: settings.debounce(),
            grace: settings.grace(),
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    /// Memory matches the last write or read
    Clean,
    /// Unsaved edits, autosave scheduled
    Dirty,
    /// A write is in flight
    Writing,
    /// Disk changed underneath us; waiting for [`Resolution`]
    ConflictPending,
    Closed,
}

/// Decision for a pending external change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Discard memory and take the disk content
    Reload,
    /// Keep memory; the next save overwrites disk
    KeepLocal,
}

/// Notifications emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Content reached disk
    Saved { at: SystemTime },
    /// A write failed; the session stays dirty and retries after the next edit
    WriteFailed { message: String },
    /// Someone else modified the file; autosave is blocked until resolved
    ExternalChangeDetected { modified: SystemTime },
    /// Content was replaced from disk
    Reloaded,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub content: String,
    pub last_write: SystemTime,
    pub write_in_flight: bool,
    pub pending_external_change: bool,
}

/// How a change notification should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeVerdict {
    /// Echo of our own recent write
    OwnWrite,
    /// Disk is not newer than what we last wrote or read
    NotNewer,
    Conflict(SystemTime),
}

/// Classify a change notification.
///
/// `since_own_write` is the time elapsed since our last successful write.
/// Inside the grace window the notification is attributed to that write;
/// otherwise only a strictly newer disk timestamp counts as a conflict.
pub(crate) fn classify_change(
    since_own_write: Option<Duration>,
    grace: Duration,
    disk_modified: Option<SystemTime>,
    last_write: SystemTime,
) -> ChangeVerdict {
    if since_own_write.is_some_and(|elapsed| elapsed < grace) {
        return ChangeVerdict::OwnWrite;
    }
    match disk_modified {
        Some(modified) if modified > last_write => ChangeVerdict::Conflict(modified),
        _ => ChangeVerdict::NotNewer,
    }
}

enum Command {
    Edit(String),
    Save(oneshot::Sender<Result<()>>),
    Resolve(Resolution, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

/// Handle to an open document.
///
/// Dropping the handle closes the session the same way [`DocumentSession::close`]
/// does, minus waiting for it.
pub struct DocumentSession {
    path: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl DocumentSession {
    /// Open `path`, using `fallback` as the content if the file cannot be read.
    ///
    /// Fails only when no grant covers the file.
    pub async fn open(
        path: impl Into<PathBuf>,
        fallback: impl Into<String>,
        grants: Arc<GrantManager>,
        config: SessionConfig,
    ) -> Result<Self> {
        let path = path.into();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            state: SessionState::Loading,
            content: String::new(),
            last_write: SystemTime::now(),
            write_in_flight: false,
            pending_external_change: false,
        });

        if !grants.ensure_access(&path).await {
            return Err(FolioError::PermissionDenied {
                path,
                reason: "no folder grant covers this document".to_string(),
            });
        }

        let content = match file_system::read_document(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Initial read failed, using fallback content");
                fallback.into()
            }
        };

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let watcher = watcher::watch(&path, move || {
            let _ = changes_tx.send(());
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            path: path.clone(),
            content,
            state: SessionState::Clean,
            last_write: SystemTime::now(),
            own_write_at: None,
            revision: 0,
            written_revision: 0,
            in_flight_revision: 0,
            pending_external_change: false,
            debounce_deadline: None,
            in_flight: None,
            save_waiters: Vec::new(),
            commands: command_rx,
            changes: changes_rx,
            events: event_tx,
            snapshot: snapshot_tx,
            watcher,
            grants,
            config,
        };
        actor.publish();
        tracing::info!(path = %path.display(), "Opened document");

        let task = tokio::spawn(actor.run());

        Ok(Self {
            path,
            commands: command_tx,
            events: event_rx,
            snapshot: snapshot_rx,
            task: Some(task),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current in-memory content
    pub fn content(&self) -> String {
        self.snapshot.borrow().content.clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Full view of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Replace the in-memory content; autosave follows after the debounce window
    pub fn edit(&self, content: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::Edit(content.into()))
            .map_err(|_| FolioError::SessionClosed)
    }

    /// Write the current content now instead of waiting for autosave
    pub async fn save(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Save(tx))
            .map_err(|_| FolioError::SessionClosed)?;
        rx.await.map_err(|_| FolioError::SessionClosed)?
    }

    /// Settle a pending external change
    pub async fn resolve(&self, resolution: Resolution) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Resolve(resolution, tx))
            .map_err(|_| FolioError::SessionClosed)?;
        rx.await.map_err(|_| FolioError::SessionClosed)?
    }

    /// Next notification, or `None` once the session has shut down
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait until the session reaches `state`
    pub async fn wait_for_state(&mut self, state: SessionState) -> Result<()> {
        self.snapshot
            .wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| FolioError::SessionClosed)
    }

    /// Stop watching, let any in-flight write finish and flush unsaved edits
    pub async fn close(mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            joined(task.await)?;
        }
        tracing::info!(path = %self.path.display(), "Closed document");
        Ok(())
    }
}

struct SessionActor {
    path: PathBuf,
    content: String,
    state: SessionState,
    /// Timestamp of our last successful write (or read), compared with disk mtime
    last_write: SystemTime,
    /// When our last write completed, for the grace window
    own_write_at: Option<Instant>,
    /// Bumped on every edit or reload
    revision: u64,
    /// Revision known to be on disk
    written_revision: u64,
    /// Revision carried by the in-flight write
    in_flight_revision: u64,
    pending_external_change: bool,
    debounce_deadline: Option<Instant>,
    in_flight: Option<JoinHandle<Result<SystemTime>>>,
    /// Explicit saves waiting for the revision they asked for to reach disk
    save_waiters: Vec<(u64, oneshot::Sender<Result<()>>)>,
    commands: mpsc::UnboundedReceiver<Command>,
    changes: mpsc::UnboundedReceiver<()>,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    watcher: WatchHandle,
    grants: Arc<GrantManager>,
    config: SessionConfig,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(()) = self.changes.recv() => self.on_external_change().await,
                result = wait_for_write(&mut self.in_flight) => self.finish_write(result).await,
                _ = wait_for_deadline(self.debounce_deadline) => {
                    self.debounce_deadline = None;
                    self.start_write();
                }
            }
            self.publish();
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Edit(content) => self.on_edit(content),
            Command::Save(reply) => self.on_save(reply),
            Command::Resolve(resolution, reply) => {
                let result = self.on_resolve(resolution).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Close(_) => unreachable!("close is handled by the run loop"),
        }
    }

    fn on_edit(&mut self, content: String) {
        if content == self.content {
            return;
        }
        self.content = content;
        self.revision += 1;

        match self.state {
            SessionState::Clean | SessionState::Dirty => {
                self.state = SessionState::Dirty;
                self.arm_debounce();
            }
            // Captured; picked up when the write completes or the conflict is resolved.
            SessionState::Writing | SessionState::ConflictPending => {}
            SessionState::Loading | SessionState::Closed => {}
        }
    }

    fn on_save(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.state == SessionState::ConflictPending {
            let _ = reply.send(Err(FolioError::ConflictPending));
            return;
        }
        self.save_waiters.push((self.revision, reply));
        self.debounce_deadline = None;
        self.start_write();
    }

    async fn on_resolve(&mut self, resolution: Resolution) -> Result<()> {
        if self.state != SessionState::ConflictPending {
            return Err(FolioError::NoConflictPending);
        }

        match resolution {
            Resolution::Reload => {
                if !self.grants.ensure_access(&self.path).await {
                    return Err(self.permission_denied());
                }
                let content = file_system::read_document(&self.path).await?;
                self.content = content;
                self.revision += 1;
                self.written_revision = self.revision;
                self.last_write = SystemTime::now();
                self.state = SessionState::Clean;
                self.emit(SessionEvent::Reloaded);
                tracing::info!(path = %self.path.display(), "Reloaded document from disk");
            }
            Resolution::KeepLocal => {
                self.last_write = SystemTime::now();
                if self.revision > self.written_revision {
                    self.state = SessionState::Dirty;
                    self.arm_debounce();
                } else {
                    self.state = SessionState::Clean;
                }
                tracing::info!(path = %self.path.display(), "Kept local content over external change");
            }
        }
        Ok(())
    }

    async fn on_external_change(&mut self) {
        match self.state {
            SessionState::ConflictPending | SessionState::Closed | SessionState::Loading => return,
            SessionState::Writing => {
                // Judged once the write lands, so our own write is not mistaken for a foreign one.
                self.pending_external_change = true;
                return;
            }
            SessionState::Clean | SessionState::Dirty => {}
        }

        let disk_modified = file_system::modified_time(&self.path).await;
        let since_own_write = self.own_write_at.map(|at| at.elapsed());
        match classify_change(since_own_write, self.config.grace, disk_modified, self.last_write) {
            ChangeVerdict::OwnWrite => {
                tracing::trace!(path = %self.path.display(), "Ignoring echo of own write");
            }
            ChangeVerdict::NotNewer => {
                tracing::trace!(path = %self.path.display(), "Disk is not newer than last write");
            }
            ChangeVerdict::Conflict(modified) => {
                tracing::info!(path = %self.path.display(), "External change detected");
                self.state = SessionState::ConflictPending;
                self.debounce_deadline = None;
                self.emit(SessionEvent::ExternalChangeDetected { modified });
            }
        }
    }

    fn arm_debounce(&mut self) {
        self.debounce_deadline = Some(Instant::now() + self.config.debounce);
    }

    fn start_write(&mut self) {
        if self.in_flight.is_some()
            || self.state == SessionState::ConflictPending
            || self.state == SessionState::Closed
        {
            return;
        }

        self.state = SessionState::Writing;
        self.in_flight_revision = self.revision;

        let grants = self.grants.clone();
        let path = self.path.clone();
        let content = self.content.clone();
        self.in_flight = Some(tokio::spawn(async move {
            if !grants.ensure_access(&path).await {
                return Err(FolioError::PermissionDenied {
                    path,
                    reason: "no folder grant covers this document".to_string(),
                });
            }
            file_system::write_atomic(&path, &content).await?;
            Ok(SystemTime::now())
        }));
    }

    async fn finish_write(&mut self, result: Result<SystemTime>) {
        match result {
            Ok(at) => {
                self.last_write = at;
                self.own_write_at = Some(Instant::now());
                self.written_revision = self.in_flight_revision;
                tracing::debug!(path = %self.path.display(), "Saved document");

                let written = self.written_revision;
                let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.save_waiters)
                    .into_iter()
                    .partition(|(revision, _)| *revision <= written);
                self.save_waiters = waiting;

                // Edits made while writing wait for a fresh debounce unless a save asked for them.
                if self.revision > written {
                    self.state = SessionState::Dirty;
                    if self.save_waiters.is_empty() {
                        self.arm_debounce();
                    } else {
                        self.start_write();
                    }
                } else {
                    self.state = SessionState::Clean;
                }
                self.emit(SessionEvent::Saved { at });
                for (_, waiter) in done {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Autosave failed");
                self.state = SessionState::Dirty;
                let message = e.to_string();
                self.emit(SessionEvent::WriteFailed {
                    message: message.clone(),
                });
                for (_, waiter) in self.save_waiters.drain(..) {
                    let _ = waiter.send(Err(FolioError::WriteFailed(message.clone())));
                }
            }
        }

        if std::mem::take(&mut self.pending_external_change) {
            self.on_external_change().await;
        }
    }

    async fn shutdown(&mut self) {
        self.watcher.cancel();
        self.debounce_deadline = None;

        // In-flight writes always complete; unsaved edits get one final attempt.
        let mut flushed = false;
        loop {
            if self.in_flight.is_some() {
                let result = wait_for_write(&mut self.in_flight).await;
                self.finish_write(result).await;
            } else if self.state == SessionState::Dirty && !flushed {
                flushed = true;
                self.start_write();
            } else {
                break;
            }
        }

        for (_, waiter) in self.save_waiters.drain(..) {
            let _ = waiter.send(Err(FolioError::SessionClosed));
        }
        self.state = SessionState::Closed;
        self.publish();
    }

    fn permission_denied(&self) -> FolioError {
        FolioError::PermissionDenied {
            path: self.path.clone(),
            reason: "no folder grant covers this document".to_string(),
        }
    }

    /// Publish the current snapshot, then deliver `event`
    fn emit(&self, event: SessionEvent) {
        self.publish();
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state,
            content: self.content.clone(),
            last_write: self.last_write,
            write_in_flight: self.in_flight.is_some(),
            pending_external_change: self.pending_external_change,
        });
    }
}

async fn wait_for_write(slot: &mut Option<JoinHandle<Result<SystemTime>>>) -> Result<SystemTime> {
    let Some(handle) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *slot = None;
    joined(result)?
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
