use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::RunRequest;

/// Client configuration, stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the task service API (endpoints are resolved below it)
    pub api_url: String,
    /// Seconds between reachability probes
    pub probe_interval_secs: u64,
    /// Timeout for non-streaming requests, in seconds
    pub request_timeout_secs: u64,
    /// Settings sent with every task submission
    pub run: RunSettings,
}

/// Fixed configuration bundle attached to each submitted task.
///
/// Opaque to this client; it is forwarded to the service as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub working_dir: String,
    pub provider: String,
    pub model: String,
    pub max_steps: u32,
    pub config_file: String,
    pub must_patch: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_path: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            working_dir: "workspace".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            max_steps: 20,
            config_file: "trae_config.yaml".to_string(),
            must_patch: false,
            patch_path: None,
        }
    }
}

impl RunSettings {
    /// Build the `/run` body for one task.
    pub fn request_for(&self, task: &str) -> RunRequest {
        RunRequest {
            task: task.to_string(),
            working_dir: self.working_dir.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            max_steps: self.max_steps,
            config_file: self.config_file.clone(),
            must_patch: self.must_patch,
            patch_path: self.patch_path.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".to_string(),
            probe_interval_secs: 30,
            request_timeout_secs: 30,
            run: RunSettings::default(),
        }
    }
}

impl Config {
    /// `~/.taskstream/config.toml`
    pub fn default_path() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".taskstream").join("config.toml")
    }

    /// Load configuration from file; a missing file yields the defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
