//! Access grants for folders outside the application's own storage area
//!
//! A grant pairs a folder with a durable capability token. Tokens are
//! persisted as soon as a folder is opened and exercised again at start-up,
//! so autosave keeps working across restarts without asking the user.
//!
//! Provider calls may touch the file system, so they run on the blocking
//! pool rather than on the async worker holding the grant lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task;

use super::file_system;
use crate::error::{joined, FolioError, Result};

/// Permission to access one folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    /// Folder the grant authorizes
    pub path: PathBuf,
    /// Opaque capability token
    pub token: Vec<u8>,
    /// Token is currently exercised
    pub active: bool,
    /// Underlying credential expired and must be re-issued
    pub stale: bool,
}

impl AccessGrant {
    fn new(path: PathBuf, token: Vec<u8>) -> Self {
        Self {
            path,
            token,
            active: false,
            stale: false,
        }
    }
}

/// Outcome of resolving a stored token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    pub path: PathBuf,
    pub stale: bool,
}

/// Issues and exercises capability tokens.
///
/// This is the seam to the platform's sandbox: implementations decide what a
/// token contains and what "exercising" it means.
pub trait CapabilityProvider: Send + Sync {
    /// Derive a durable token for `folder`
    fn issue(&self, folder: &Path) -> Result<Vec<u8>>;

    /// Resolve a token back to its folder and report whether it is stale
    fn resolve(&self, token: &[u8]) -> Result<ResolvedToken>;

    /// Begin exercising access to `folder`; false when the OS refuses
    fn start_access(&self, folder: &Path) -> bool;

    /// Stop exercising access to `folder`
    fn stop_access(&self, folder: &Path);
}

#[derive(Debug, Serialize, Deserialize)]
struct LocalToken {
    path: PathBuf,
    canonical: PathBuf,
    issued_at: DateTime<Utc>,
}

/// Capability provider for platforms without a sandbox broker.
///
/// Tokens record where the folder lived when it was granted; a token goes
/// stale when the folder's canonical location changes or it gets too old.
#[derive(Debug, Clone)]
pub struct LocalCapabilityProvider {
    max_age: Duration,
}

impl Default for LocalCapabilityProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 24 * 60 * 60))
    }
}

impl LocalCapabilityProvider {
    /// Create a provider whose tokens expire after `max_age`
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl CapabilityProvider for LocalCapabilityProvider {
    fn issue(&self, folder: &Path) -> Result<Vec<u8>> {
        let canonical = folder
            .canonicalize()
            .map_err(|e| FolioError::from_io(folder, e))?;
        let token = LocalToken {
            path: folder.to_path_buf(),
            canonical,
            issued_at: Utc::now(),
        };
        Ok(serde_json::to_vec(&token)?)
    }

    fn resolve(&self, token: &[u8]) -> Result<ResolvedToken> {
        let token: LocalToken =
            serde_json::from_slice(token).map_err(|e| FolioError::InvalidToken(e.to_string()))?;
        let canonical = token
            .path
            .canonicalize()
            .map_err(|e| FolioError::from_io(&token.path, e))?;

        let age = Utc::now()
            .signed_duration_since(token.issued_at)
            .to_std()
            .unwrap_or_default();
        let stale = canonical != token.canonical || age > self.max_age;

        Ok(ResolvedToken {
            path: token.path,
            stale,
        })
    }

    fn start_access(&self, folder: &Path) -> bool {
        match std::fs::read_dir(folder) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(path = %folder.display(), error = %e, "Folder is not accessible");
                false
            }
        }
    }

    fn stop_access(&self, folder: &Path) {
        tracing::trace!(path = %folder.display(), "Released folder access");
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredGrants {
    /// Folder path -> base64 token
    grants: BTreeMap<PathBuf, String>,
}

/// Durable record of granted folders, one entry per folder path
#[derive(Debug, Clone)]
pub struct GrantStore {
    path: PathBuf,
}

impl GrantStore {
    /// Store grants in the JSON file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted token; a missing file means no grants
    pub async fn load(&self) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(FolioError::from_io(&self.path, e)),
        };

        let stored: StoredGrants = serde_json::from_str(&content)?;
        let mut tokens = BTreeMap::new();
        for (folder, encoded) in stored.grants {
            match STANDARD.decode(encoded.as_bytes()) {
                Ok(token) => {
                    tokens.insert(folder, token);
                }
                Err(e) => {
                    tracing::warn!(path = %folder.display(), error = %e, "Dropping undecodable grant")
                }
            }
        }
        Ok(tokens)
    }

    /// Replace the persisted records with `grants`
    pub async fn save<'a>(&self, grants: impl IntoIterator<Item = &'a AccessGrant>) -> Result<()> {
        let stored = StoredGrants {
            grants: grants
                .into_iter()
                .map(|g| (g.path.clone(), STANDARD.encode(&g.token)))
                .collect(),
        };
        let content = serde_json::to_string_pretty(&stored)?;
        file_system::write_atomic(&self.path, &content).await
    }
}

#[derive(Debug, Default)]
struct GrantState {
    grants: BTreeMap<PathBuf, AccessGrant>,
    /// Active grant targets in activation order
    active: Vec<PathBuf>,
}

impl GrantState {
    fn active_covering(&self, folder: &Path) -> Option<&PathBuf> {
        self.active.iter().find(|target| has_prefix(folder, target))
    }
}

/// Owns the set of grants and which of them are active.
///
/// Shared between sessions behind an `Arc`; all mutation goes through its
/// methods, which serialize on an internal lock.
pub struct GrantManager {
    provider: Arc<dyn CapabilityProvider>,
    store: GrantStore,
    state: Mutex<GrantState>,
}

impl GrantManager {
    /// Load persisted grants from `store`; nothing is activated yet
    pub async fn load(store: GrantStore, provider: Arc<dyn CapabilityProvider>) -> Result<Self> {
        let grants = store
            .load()
            .await?
            .into_iter()
            .map(|(path, token)| (path.clone(), AccessGrant::new(path, token)))
            .collect();

        Ok(Self {
            provider,
            store,
            state: Mutex::new(GrantState {
                grants,
                active: Vec::new(),
            }),
        })
    }

    /// Re-activate every persisted grant, folders listed in `order` first.
    ///
    /// Returns the folders that are active afterwards.
    pub async fn restore(&self, order: &[PathBuf]) -> Vec<PathBuf> {
        let mut state = self.state.lock().await;

        let mut targets: Vec<PathBuf> = order
            .iter()
            .filter(|p| state.grants.contains_key(*p))
            .cloned()
            .collect();
        for path in state.grants.keys() {
            if !targets.contains(path) {
                targets.push(path.clone());
            }
        }

        for target in &targets {
            match self.activate(&mut state, target).await {
                Ok(true) => tracing::info!(path = %target.display(), "Restored folder access"),
                Ok(false) => tracing::warn!(path = %target.display(), "Folder access was refused"),
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "Could not restore folder access")
                }
            }
        }

        state.active.clone()
    }

    /// Ensure `folder` (or an ancestor) has an active grant.
    ///
    /// When a grant for an ancestor already exists, that ancestor is what
    /// becomes active: `/docs/sub` under a granted `/docs` activates `/docs`
    /// and gets no grant of its own. A folder with no covering grant is
    /// treated as freshly chosen by the user; its grant is persisted only once
    /// access to it has been started. Errors are logged and read as "not
    /// authorized".
    pub async fn authorize(&self, folder: &Path) -> bool {
        match self.try_authorize(folder).await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(path = %folder.display(), error = %e, "Authorization failed");
                false
            }
        }
    }

    async fn try_authorize(&self, folder: &Path) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.active_covering(folder).is_some() {
            return Ok(true);
        }

        let existing = state
            .grants
            .keys()
            .find(|target| has_prefix(folder, target))
            .cloned();
        match existing {
            Some(target) => self.activate(&mut state, &target).await,
            None => self.grant_new(&mut state, folder).await,
        }
    }

    async fn grant_new(&self, state: &mut GrantState, folder: &Path) -> Result<bool> {
        let token = self.issue(folder).await?;
        if !self.start_access(folder).await? {
            tracing::warn!(path = %folder.display(), "Folder access was refused");
            return Ok(false);
        }

        let mut grant = AccessGrant::new(folder.to_path_buf(), token);
        grant.active = true;
        state.grants.insert(folder.to_path_buf(), grant);
        state.active.push(folder.to_path_buf());

        if let Err(e) = self.store.save(state.grants.values()).await {
            state.grants.remove(folder);
            state.active.retain(|p| p != folder);
            self.stop_access(folder).await;
            return Err(e);
        }
        tracing::info!(path = %folder.display(), "Persisted folder grant");
        Ok(true)
    }

    /// Derive and store a token for `folder`, replacing any previous one
    pub async fn persist(&self, folder: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        self.persist_locked(&mut state, folder).await
    }

    async fn persist_locked(&self, state: &mut GrantState, folder: &Path) -> Result<()> {
        let token = self.issue(folder).await?;
        let was_active = state.grants.get(folder).map(|g| g.active).unwrap_or(false);

        let mut grant = AccessGrant::new(folder.to_path_buf(), token);
        grant.active = was_active;
        state.grants.insert(folder.to_path_buf(), grant);

        self.store.save(state.grants.values()).await?;
        tracing::info!(path = %folder.display(), "Persisted folder grant");
        Ok(())
    }

    /// Make sure the folder containing `file` is accessible.
    ///
    /// Succeeds at once when an active grant covers it; otherwise looks for a
    /// persisted grant matching the folder and activates it. False means no
    /// grant applies and the caller must report a permission error.
    pub async fn ensure_access(&self, file: &Path) -> bool {
        let folder = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(file);
        self.ensure_folder_access(folder).await
    }

    /// Like [`GrantManager::ensure_access`] for a folder itself
    pub async fn ensure_folder_access(&self, folder: &Path) -> bool {
        let mut state = self.state.lock().await;
        if state.active_covering(folder).is_some() {
            return true;
        }

        let candidate = state
            .grants
            .keys()
            .find(|target| has_prefix(folder, target) || has_suffix(target, folder))
            .cloned();
        let Some(target) = candidate else {
            tracing::debug!(path = %folder.display(), "No grant covers folder");
            return false;
        };

        match self.activate(&mut state, &target).await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %e, "Could not activate grant");
                false
            }
        }
    }

    /// Deactivate and forget the grant for `folder`. Returns whether one existed.
    pub async fn close(&self, folder: &Path) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(grant) = state.grants.remove(folder) else {
            return Ok(false);
        };

        if grant.active {
            self.stop_access(&grant.path).await;
        }
        state.active.retain(|p| p != folder);
        self.store.save(state.grants.values()).await?;

        tracing::info!(path = %folder.display(), "Closed folder");
        Ok(true)
    }

    /// Folders with an active grant, in activation order
    pub async fn active_folders(&self) -> Vec<PathBuf> {
        self.state.lock().await.active.clone()
    }

    /// Snapshot of the grant for exactly `folder`
    pub async fn grant(&self, folder: &Path) -> Option<AccessGrant> {
        self.state.lock().await.grants.get(folder).cloned()
    }

    /// Exercise the grant for `target`, refreshing a stale token first
    async fn activate(&self, state: &mut GrantState, target: &Path) -> Result<bool> {
        let token = match state.grants.get(target) {
            Some(grant) if grant.active => return Ok(true),
            Some(grant) => grant.token.clone(),
            None => return Ok(false),
        };

        let resolved = self.resolve(token).await?;
        if resolved.stale {
            tracing::info!(path = %target.display(), "Refreshing stale grant");
            if let Some(grant) = state.grants.get_mut(target) {
                grant.stale = true;
            }
            let fresh = self.issue(target).await?;
            if let Some(grant) = state.grants.get_mut(target) {
                grant.token = fresh;
                grant.stale = false;
            }
            self.store.save(state.grants.values()).await?;
        }

        if !self.start_access(target).await? {
            return Ok(false);
        }

        if let Some(grant) = state.grants.get_mut(target) {
            grant.active = true;
        }
        if !state.active.iter().any(|p| p == target) {
            state.active.push(target.to_path_buf());
        }
        tracing::debug!(path = %target.display(), "Activated grant");
        Ok(true)
    }

    async fn issue(&self, folder: &Path) -> Result<Vec<u8>> {
        let provider = self.provider.clone();
        let folder = folder.to_path_buf();
        joined(task::spawn_blocking(move || provider.issue(&folder)).await)?
    }

    async fn resolve(&self, token: Vec<u8>) -> Result<ResolvedToken> {
        let provider = self.provider.clone();
        joined(task::spawn_blocking(move || provider.resolve(&token)).await)?
    }

    async fn start_access(&self, folder: &Path) -> Result<bool> {
        let provider = self.provider.clone();
        let folder = folder.to_path_buf();
        joined(task::spawn_blocking(move || provider.start_access(&folder)).await)
    }

    async fn stop_access(&self, folder: &Path) {
        let provider = self.provider.clone();
        let target = folder.to_path_buf();
        if let Err(e) = joined(task::spawn_blocking(move || provider.stop_access(&target)).await) {
            tracing::warn!(path = %folder.display(), error = %e, "Could not release folder access");
        }
    }
}

// Matching is on the raw path string: "/docs" also covers "/docs-old", and
// symlinked aliases of the same folder do not match each other.
fn has_prefix(path: &Path, prefix: &Path) -> bool {
    path.to_string_lossy().starts_with(&*prefix.to_string_lossy())
}

fn has_suffix(path: &Path, suffix: &Path) -> bool {
    path.to_string_lossy().ends_with(&*suffix.to_string_lossy())
}
