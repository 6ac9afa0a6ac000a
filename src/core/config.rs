//! Application configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{FolioError, Result};
use crate::versioning::DEFAULT_PROGRAM;

/// Default quiescence period before an edit is written
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
/// Default period during which change notifications count as our own write
pub const DEFAULT_GRACE_MS: u64 = 1000;
/// Default lifetime of a folder grant token
pub const DEFAULT_MAX_TOKEN_AGE_DAYS: u64 = 30;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Recently opened folders, derived from the active grants
    pub recent_folders: Vec<PathBuf>,
    /// Document session settings
    pub session: SessionSettings,
    /// Version control settings
    pub versioning: VersioningSettings,
    /// Folder grant settings
    pub grants: GrantSettings,
}

/// Autosave and conflict detection timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Milliseconds without edits before autosave
    pub debounce_ms: u64,
    /// Milliseconds after a save during which change notifications are ignored
    pub grace_ms: u64,
}

/// Version control settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningSettings {
    /// Program invoked for version control
    pub program: String,
}

/// Folder grant settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantSettings {
    /// Days before a grant token is considered stale and re-issued
    pub max_token_age_days: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            recent_folders: Vec::new(),
            session: SessionSettings::default(),
            versioning: VersioningSettings::default(),
            grants: GrantSettings::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            grace_ms: DEFAULT_GRACE_MS,
        }
    }
}

impl Default for VersioningSettings {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
        }
    }
}

impl Default for GrantSettings {
    fn default() -> Self {
        Self {
            max_token_age_days: DEFAULT_MAX_TOKEN_AGE_DAYS,
        }
    }
}

impl SessionSettings {
    /// Autosave debounce window
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Own-write grace window
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl GrantSettings {
    /// Maximum grant token age
    pub fn max_token_age(&self) -> Duration {
        Duration::from_secs(self.max_token_age_days * 24 * 60 * 60)
    }
}

impl AppConfig {
    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("com", "folio", "Folio")
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Get the path of the persisted folder grants
    pub fn grants_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().join("grants.json"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path().ok_or_else(no_config_dir)?;
        Self::load_from(&path)
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| FolioError::from_io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or_else(no_config_dir)?;
        self.save_to(&path)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FolioError::from_io(parent, e))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| FolioError::from_io(path, e))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Bring `recent_folders` in line with the active folders.
    ///
    /// Returns true only when the list changed, i.e. when it needs saving.
    pub fn sync_recent_folders(&mut self, active: &[PathBuf]) -> bool {
        if self.recent_folders == active {
            return false;
        }
        self.recent_folders = active.to_vec();
        true
    }
}

fn no_config_dir() -> FolioError {
    FolioError::NotFound {
        path: PathBuf::from("<config directory>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.session.debounce(), Duration::from_millis(1000));
        assert_eq!(config.versioning.program, "git");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        config.session.grace_ms = 250;
        config.recent_folders.push(PathBuf::from("/docs"));
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "session": { "debounce_ms": 200 } }"#).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.session.debounce_ms, 200);
        assert_eq!(config.session.grace_ms, DEFAULT_GRACE_MS);
        assert_eq!(config.grants.max_token_age_days, DEFAULT_MAX_TOKEN_AGE_DAYS);
    }

    #[test]
    fn test_sync_recent_folders_reports_changes_only() {
        let mut config = AppConfig::default();
        let active = vec![PathBuf::from("/docs"), PathBuf::from("/notes")];

        assert!(config.sync_recent_folders(&active));
        assert!(!config.sync_recent_folders(&active));
        assert_eq!(config.recent_folders, active);

        assert!(config.sync_recent_folders(&[]));
        assert!(config.recent_folders.is_empty());
    }
}
