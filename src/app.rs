//! Workspace state and coordination of grants, sessions and versioning

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::core::document::{DocumentSession, SessionConfig};
use crate::core::grants::{GrantManager, GrantStore, LocalCapabilityProvider};
use crate::error::{FolioError, Result};
use crate::process::{CommandRunner, ProcessRunner};
use crate::versioning::{CommitRecord, VersioningClient};

/// Entry point for collaborators (UI, rendering, settings).
///
/// Built once by the process entry point; the grant manager is shared with
/// every document session it opens.
pub struct Workspace<R = ProcessRunner> {
    /// Application configuration
    config: AppConfig,
    /// Where configuration is saved; `None` keeps it in memory
    config_path: Option<PathBuf>,
    /// Folder grants shared with open sessions
    grants: Arc<GrantManager>,
    /// Version control client
    versioning: VersioningClient<R>,
}

impl Workspace<ProcessRunner> {
    /// Build a workspace from the platform's default config and data locations
    pub async fn load_default() -> Result<Self> {
        let config_path = AppConfig::config_path();
        let config = match &config_path {
            Some(path) => AppConfig::load_from(path)?,
            None => AppConfig::default(),
        };
        let grants_path = AppConfig::grants_path().ok_or_else(|| FolioError::NotFound {
            path: PathBuf::from("<data directory>"),
        })?;

        let provider = Arc::new(LocalCapabilityProvider::new(config.grants.max_token_age()));
        let grants = GrantManager::load(GrantStore::new(grants_path), provider).await?;
        let versioning = VersioningClient::new(config.versioning.program.clone());

        Ok(Self::start(config, config_path, Arc::new(grants), versioning).await)
    }
}

impl<R: CommandRunner> Workspace<R> {
    /// Assemble a workspace and restore previously granted folders
    pub async fn start(
        config: AppConfig,
        config_path: Option<PathBuf>,
        grants: Arc<GrantManager>,
        versioning: VersioningClient<R>,
    ) -> Self {
        let mut workspace = Self {
            config,
            config_path,
            grants,
            versioning,
        };

        let restored = workspace
            .grants
            .restore(&workspace.config.recent_folders)
            .await;
        tracing::info!("Restored access to {} folders", restored.len());
        workspace.sync_recent_folders().await;
        workspace
    }

    /// Current configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Shared grant manager
    pub fn grants(&self) -> &Arc<GrantManager> {
        &self.grants
    }

    /// Grant access to `folder`; returns whether access is now active
    pub async fn open_folder(&mut self, folder: &Path) -> bool {
        let active = self.grants.authorize(folder).await;
        if active {
            tracing::info!(path = %folder.display(), "Opened folder");
        }
        self.sync_recent_folders().await;
        active
    }

    /// Revoke access to `folder`; returns whether it was open
    pub async fn close_folder(&mut self, folder: &Path) -> Result<bool> {
        let closed = self.grants.close(folder).await?;
        self.sync_recent_folders().await;
        Ok(closed)
    }

    /// Folders currently accessible
    pub async fn open_folders(&self) -> Vec<PathBuf> {
        self.grants.active_folders().await
    }

    /// Open a document with empty fallback content
    pub async fn open_document(&self, path: &Path) -> Result<DocumentSession> {
        self.open_document_with(path, String::new()).await
    }

    /// Open a document, using `fallback` if it cannot be read
    pub async fn open_document_with(
        &self,
        path: &Path,
        fallback: impl Into<String>,
    ) -> Result<DocumentSession> {
        let config: SessionConfig = self.config.session.clone().into();
        DocumentSession::open(path, fallback, self.grants.clone(), config).await
    }

    /// Initialize version control in `folder`
    pub async fn init_versioning(&self, folder: &Path) -> Result<String> {
        self.require_access(folder).await?;
        self.versioning.init_repository(folder).await
    }

    /// Record a version of everything in `folder`
    pub async fn record_version(&self, message: &str, folder: &Path) -> Result<String> {
        self.require_access(folder).await?;
        self.versioning.commit(message, folder).await
    }

    /// Version history of `file`, newest first
    pub async fn history(&self, file: &Path, folder: &Path) -> Result<Vec<CommitRecord>> {
        self.require_access(folder).await?;
        self.versioning.log(file, folder).await
    }

    /// Short-form status of `folder`
    pub async fn status(&self, folder: &Path) -> Result<String> {
        self.require_access(folder).await?;
        self.versioning.status(folder).await
    }

    /// Whether `folder` has changes not yet recorded
    pub async fn has_pending_changes(&self, folder: &Path) -> bool {
        if !self.grants.ensure_folder_access(folder).await {
            return false;
        }
        self.versioning.has_changes(folder).await
    }

    async fn require_access(&self, folder: &Path) -> Result<()> {
        if self.grants.ensure_folder_access(folder).await {
            Ok(())
        } else {
            Err(FolioError::PermissionDenied {
                path: folder.to_path_buf(),
                reason: "folder has not been opened".to_string(),
            })
        }
    }

    /// Derive the recent-folder list from the active grants and save on change
    async fn sync_recent_folders(&mut self) {
        let active = self.grants.active_folders().await;
        if !self.config.sync_recent_folders(&active) {
            return;
        }
        if let Some(path) = &self.config_path {
            if let Err(e) = self.config.save_to(path) {
                tracing::error!("Failed to save config: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn workspace(dir: &Path) -> Workspace {
        let grants = GrantManager::load(
            GrantStore::new(dir.join("grants.json")),
            Arc::new(LocalCapabilityProvider::default()),
        )
        .await
        .unwrap();
        Workspace::start(
            AppConfig::default(),
            Some(dir.join("config.json")),
            Arc::new(grants),
            VersioningClient::default(),
        )
        .await
    }

    #[tokio::test]
    async fn test_open_folder_updates_recent_folders() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();

        let mut ws = workspace(dir.path()).await;
        assert!(ws.open_folder(&docs).await);
        assert_eq!(ws.config().recent_folders, vec![docs.clone()]);

        let saved = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(saved.recent_folders, vec![docs.clone()]);

        assert!(ws.close_folder(&docs).await.unwrap());
        assert!(ws.config().recent_folders.is_empty());
        assert!(ws.open_folders().await.is_empty());
    }

    #[tokio::test]
    async fn test_versioning_requires_open_folder() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path()).await;
        let err = ws.init_versioning(dir.path()).await.unwrap_err();
        assert!(matches!(err, FolioError::PermissionDenied { .. }));
        assert!(!ws.has_pending_changes(dir.path()).await);
    }

    #[tokio::test]
    async fn test_missing_folder_cannot_be_opened() {
        let dir = tempfile::tempdir().unwrap();
        let mut ws = workspace(dir.path()).await;
        assert!(!ws.open_folder(&dir.path().join("missing")).await);
        assert!(ws.config().recent_folders.is_empty());
    }
}
