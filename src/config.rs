use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::InstallScope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flatpak_bin: String,
    pub distrobox_bin: String,
    pub default_remote: String,
    pub remote_url: String,
    pub default_branch: String,
    pub scope: InstallScope,
    /// Upper bound on operations running at the same time.
    pub max_concurrent: usize,
    pub cancel_grace_ms: u64,
    /// Terminal operations kept around for display.
    pub retain_terminal: usize,
    pub log_limit: usize,
    pub log_tail_lines: usize,
    pub auto_confirm: bool,
    pub default_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flatpak_bin: "flatpak".to_string(),
            distrobox_bin: "distrobox".to_string(),
            default_remote: "flathub".to_string(),
            remote_url: "https://flathub.org/repo/flathub.flatpakrepo".to_string(),
            default_branch: "stable".to_string(),
            scope: InstallScope::User,
            max_concurrent: 2,
            cancel_grace_ms: 3000,
            retain_terminal: 32,
            log_limit: 2000,
            log_tail_lines: 20,
            auto_confirm: true,
            default_image: "registry.fedoraproject.org/fedora-toolbox:latest".to_string(),
        }
    }
}

impl Config {
    /// Load the user config, writing the defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent == 0 {
            return Err(CoreError::Config("max_concurrent must be at least 1".into()));
        }
        if self.flatpak_bin.trim().is_empty() || self.distrobox_bin.trim().is_empty() {
            return Err(CoreError::Config("tool binaries must not be empty".into()));
        }
        if self.default_remote.trim().is_empty() || self.default_branch.trim().is_empty() {
            return Err(CoreError::Config("default remote and branch must be set".into()));
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    fn config_path() -> Result<PathBuf> {
        let base = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = std::env::var("HOME").context("HOME is not set")?;
                PathBuf::from(home).join(".config")
            }
        };
        Ok(base.join("origami").join("config.json"))
    }
}
