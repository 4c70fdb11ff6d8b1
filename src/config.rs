use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::status::SubjectKind;

/// A subject the watcher should track from startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedSubject {
    pub id: String,
    pub kind: SubjectKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Base URL of the platform backend.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer credential. Usually left unset here and supplied via
    /// TRAINWATCH_API_TOKEN instead, so the config file can be committed.
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Consecutive 401/403 responses tolerated before synchronization
    /// halts for all subjects.
    #[serde(default = "default_auth_failure_limit")]
    pub auth_failure_limit: u32,

    /// Also listen on the websocket push stream; polling still runs, the
    /// synchronizer absorbs the duplicate deliveries.
    #[serde(default = "default_enable_push_stream")]
    pub enable_push_stream: bool,

    #[serde(default)]
    pub subjects: Vec<WatchedSubject>,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_auth_failure_limit() -> u32 {
    3
}

fn default_enable_push_stream() -> bool {
    true
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: None,
            poll_interval_secs: default_poll_interval_secs(),
            auth_failure_limit: default_auth_failure_limit(),
            enable_push_stream: default_enable_push_stream(),
            subjects: Vec::new(),
        }
    }
}

impl WatchConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("trainwatch.toml")
    }

    /// Load config from trainwatch.toml (next to executable), falling
    /// back to environment variables. Never fails; defaults fill gaps.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<WatchConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Environment variables win over file contents.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("TRAINWATCH_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = url;
            }
        }

        if let Ok(token) = env::var("TRAINWATCH_API_TOKEN") {
            let token = token.trim().to_string();
            if !token.is_empty() {
                self.api_token = Some(token);
            }
        }

        if let Ok(interval) = env::var("TRAINWATCH_POLL_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                self.poll_interval_secs = seconds;
            }
        }

        if let Ok(enabled) = env::var("TRAINWATCH_ENABLE_PUSH_STREAM") {
            self.enable_push_stream = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }

        self
    }
}
