use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub ack_timeout_ms: u64,
    pub scroll_follow_threshold_px: f32,
    pub max_attachment_bytes: u64,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4000/socket".into(),
            ack_timeout_ms: 10_000,
            scroll_follow_threshold_px: 48.0,
            max_attachment_bytes: 10 * 1024 * 1024,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Defaults, then `path` (or `./client.toml` when present), then environment
/// overrides.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings, ConfigError> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if fallback.exists() {
                read_settings_file(&fallback)?
            } else {
                ClientSettings::default()
            }
        }
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<ClientSettings, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "config: loaded settings file");
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn apply_env_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("ROOM_CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("APP__ACK_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.ack_timeout_ms = parsed;
        }
    }

    if let Some(v) = lookup("APP__SCROLL_FOLLOW_THRESHOLD_PX") {
        if let Ok(parsed) = v.parse::<f32>() {
            settings.scroll_follow_threshold_px = parsed;
        }
    }

    if let Some(v) = lookup("APP__MAX_ATTACHMENT_BYTES") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_attachment_bytes = parsed;
        }
    }

    if let Some(v) = lookup("APP__EVENT_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_buffer = parsed.max(1);
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
