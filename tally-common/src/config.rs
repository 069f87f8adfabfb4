//! Configuration loading and root folder resolution

use crate::{Error, Result};
use std::path::PathBuf;

/// Resolves the service root folder following the priority order:
/// 1. Environment variable (`TALLY_ROOT_FOLDER`)
/// 2. TOML config file (`root_folder` key)
/// 3. OS-dependent compiled default (fallback)
pub struct RootFolderResolver {
    service_name: String,
}

impl RootFolderResolver {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Resolve the root folder from the highest-priority source available.
    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Environment variable
        if let Ok(path) = std::env::var("TALLY_ROOT_FOLDER") {
            tracing::debug!(
                service = %self.service_name,
                root_folder = %path,
                "Root folder resolved from environment"
            );
            return PathBuf::from(path);
        }

        // Priority 2: TOML config file
        if let Ok(config_path) = config_file_path() {
            if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
                if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                    if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                        tracing::debug!(
                            service = %self.service_name,
                            config_file = %config_path.display(),
                            root_folder = %root_folder,
                            "Root folder resolved from config file"
                        );
                        return PathBuf::from(root_folder);
                    }
                }
            }
        }

        // Priority 3: OS-dependent compiled default
        default_root_folder()
    }
}

/// Prepares the root folder on disk and derives well-known paths inside it.
pub struct RootFolderInitializer {
    root: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the root folder directory if missing.
    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
            tracing::info!(root_folder = %self.root.display(), "Created root folder");
        }
        Ok(())
    }

    /// Path of the shared SQLite database inside the root folder.
    pub fn database_path(&self) -> PathBuf {
        self.root.join("tally.db")
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

/// Get the configuration file path for the platform.
fn config_file_path() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/tally/config.toml first, then /etc/tally/config.toml
        let user_config = dirs::config_dir().map(|d| d.join("tally").join("config.toml"));
        let system_config = PathBuf::from("/etc/tally/config.toml");

        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        if system_config.exists() {
            return Ok(system_config);
        }
        Err(Error::Config("No config file found".to_string()))
    } else {
        let path = dirs::config_dir()
            .map(|d| d.join("tally").join("config.toml"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

        if path.exists() {
            Ok(path)
        } else {
            Err(Error::Config(format!("Config file not found: {:?}", path)))
        }
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("tally"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tally"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("tally"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tally"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("tally"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\tally"))
    } else {
        PathBuf::from("./tally_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_is_inside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let initializer = RootFolderInitializer::new(tmp.path().to_path_buf());
        assert!(initializer.database_path().starts_with(tmp.path()));
        assert_eq!(
            initializer.database_path().file_name().unwrap(),
            "tally.db"
        );
    }

    #[test]
    fn ensure_directory_creates_missing_folders() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let initializer = RootFolderInitializer::new(nested.clone());
        initializer.ensure_directory_exists().unwrap();
        assert!(nested.is_dir());
    }
}
