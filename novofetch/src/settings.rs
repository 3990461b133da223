//! User settings persisted as a JSON file.
//!
//! Missing fields fall back to defaults, so settings files written by
//! older versions keep loading after new options are added.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

fn default_lnd_path() -> PathBuf {
    PathBuf::from("lnd")
}

fn default_download_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_auth_timeout_secs() -> u64 {
    60
}

fn default_list_timeout_secs() -> u64 {
    120
}

fn default_auto_validate() -> bool {
    true
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Fetcher configuration.
///
/// Read once at orchestrator construction; changing the tool path or the
/// download root afterwards requires constructing a new orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the vendor's `lnd` delivery client binary.
    #[serde(default = "default_lnd_path")]
    pub lnd_path: PathBuf,
    /// Root directory under which per-task download directories are created.
    #[serde(default = "default_download_root")]
    pub download_root: PathBuf,
    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Maximum number of transfers running at the same time.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Hard timeout for the login step.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Hard timeout for the remote listing step.
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    /// Run checksum verification after each transfer.
    #[serde(default = "default_auto_validate")]
    pub auto_validate: bool,
    /// Address the HTTP API binds to.
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lnd_path: default_lnd_path(),
            download_root: default_download_root(),
            log_dir: default_log_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            auth_timeout_secs: default_auth_timeout_secs(),
            list_timeout_secs: default_list_timeout_secs(),
            auto_validate: default_auto_validate(),
            api_bind: default_api_bind(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when the
    /// file does not exist or cannot be parsed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse settings file, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Persist settings to a JSON file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check that the configured tool binary exists and is executable.
    pub fn validate_lnd_path(&self) -> Result<()> {
        validate_tool_path(&self.lnd_path)
    }
}

/// Check that a tool binary exists and is executable.
pub fn validate_tool_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::config("tool path is empty"));
    }
    let metadata = std::fs::metadata(path)
        .map_err(|_| Error::config(format!("tool binary not found: {}", path.display())))?;
    if !metadata.is_file() {
        return Err(Error::config(format!(
            "tool path is not a file: {}",
            path.display()
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(Error::config(format!(
                "tool binary is not executable: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent_tasks, 3);
        assert_eq!(settings.auth_timeout_secs, 60);
        assert_eq!(settings.list_timeout_secs, 120);
        assert!(settings.auto_validate);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path().join("nope.json"));
        assert_eq!(settings.max_concurrent_tasks, 3);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.max_concurrent_tasks = 8;
        settings.lnd_path = PathBuf::from("/opt/lnd");
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded.max_concurrent_tasks, 8);
        assert_eq!(loaded.lnd_path, PathBuf::from("/opt/lnd"));
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_concurrent_tasks": 1}"#).unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.max_concurrent_tasks, 1);
        assert_eq!(settings.auth_timeout_secs, 60);
    }

    #[test]
    fn test_validate_tool_path_missing() {
        let result = validate_tool_path(Path::new("/definitely/not/here/lnd"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_tool_path_not_executable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lnd");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        let result = validate_tool_path(&path);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
