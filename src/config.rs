use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::services::engine::EngineConfig;
use crate::services::task_store::TASKS_DIR_NAME;
use crate::services::trash::DEFAULT_TRASH_DIR_NAME;

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter directive, e.g. "info" or "panedir=debug". `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_trash_dir_name() -> String {
    DEFAULT_TRASH_DIR_NAME.to_string()
}

fn default_task_list_limit() -> usize {
    50
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory every pane path is relative to (home directory when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Where the task table is kept (config directory when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    #[serde(default = "default_trash_dir_name")]
    pub trash_dir_name: String,
    /// How many finished tasks `tasks` shows by default
    #[serde(default = "default_task_list_limit")]
    pub task_list_limit: usize,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: None,
            state_dir: None,
            trash_dir_name: default_trash_dir_name(),
            task_list_limit: default_task_list_limit(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Returns the config directory path (~/.panedir)
    pub fn config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".panedir"))
    }

    /// Returns the config file path (~/.panedir/settings.json)
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join(SETTINGS_FILE_NAME))
    }

    /// Ensures the config directory and a default settings file exist
    pub fn ensure_config_exists() {
        if let Some(config_dir) = Self::config_dir() {
            if !config_dir.exists() && create_private_dir(&config_dir).is_err() {
                return;
            }
        }

        if let Some(config_path) = Self::config_path() {
            if !config_path.exists() {
                let _ = Self::default().save();
            }
        }
    }

    /// Loads settings from the config file, returns default if not found or invalid
    pub fn load() -> Self {
        Self::load_with_error().unwrap_or_default()
    }

    /// Loads settings from the config file with error information
    pub fn load_with_error() -> Result<Self> {
        Self::ensure_config_exists();

        let config_path = Self::config_path()
            .ok_or_else(|| EngineError::Config("Could not determine config path".to_string()))?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Invalid JSON in {}: {}", path.display(), e)))
    }

    /// Saves settings to the config file using atomic write pattern
    pub fn save(&self) -> io::Result<()> {
        let Some(config_dir) = Self::config_dir() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "Could not determine config directory",
            ));
        };
        if !config_dir.exists() {
            create_private_dir(&config_dir)?;
        }
        self.save_to(&config_dir.join(SETTINGS_FILE_NAME))
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");

        // Atomic write: write to temp file first, then rename
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Resolves the browse root
    /// Security: Only accepts absolute paths and canonicalizes to resolve symlinks
    pub fn resolve_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => {
                let path = PathBuf::from(root);
                if !path.is_absolute() {
                    return Err(EngineError::Config(format!("root must be an absolute path: {}", root)));
                }
                let canonical = path
                    .canonicalize()
                    .map_err(|e| EngineError::Config(format!("root {} is not accessible: {}", root, e)))?;
                if !canonical.is_dir() {
                    return Err(EngineError::Config(format!("root is not a directory: {}", root)));
                }
                Ok(canonical)
            }
            None => dirs::home_dir()
                .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string())),
        }
    }

    /// Directory holding the `tasks/` record directory
    pub fn resolve_state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Self::config_dir()
                .ok_or_else(|| EngineError::Config("Could not determine config directory".to_string())),
        }
    }

    /// Builds the configuration the transfer engine is opened with
    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            root: self.resolve_root()?,
            tasks_dir: Some(self.resolve_state_dir()?.join(TASKS_DIR_NAME)),
            trash_dir_name: self.trash_dir_name.clone(),
        })
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    // Set directory permissions to user-only on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        let _ = fs::set_permissions(dir, perms);
    }
    Ok(())
}
