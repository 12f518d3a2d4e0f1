use std::{fs, io, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::connection::ReconnectPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_url: String,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub event_buffer: usize,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".into(),
            reconnect_base_delay_ms: 2000,
            max_reconnect_attempts: 5,
            event_buffer: 256,
            request_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid client settings")
    }

    /// Applies `MESSENGER_*` / `APP__*` overrides. Unparseable numbers are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MESSENGER_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("APP__API_URL") {
            self.api_url = v;
        }

        if let Some(parsed) = lookup("APP__RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_base_delay_ms = parsed;
        }
        if let Some(parsed) = lookup("APP__MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_reconnect_attempts = parsed;
        }
        if let Some(parsed) = lookup("APP__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = parsed;
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Defaults, then the settings file (if present), then the environment.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => Settings::from_toml_str(&raw)
            .with_context(|| format!("failed to parse '{}'", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Settings::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
