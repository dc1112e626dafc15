use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::{error::SyncError, retry::RetryPolicy};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub backend_url: String,
    pub websocket_url: Option<String>,
    pub dedup_window_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000".into(),
            websocket_url: None,
            dedup_window_ms: 5_000,
            request_timeout_ms: 10_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 8,
        }
    }
}

impl ClientSettings {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.reconnect_max_attempts,
        )
    }

    /// Explicit websocket url when configured, otherwise derived from the
    /// backend url.
    pub fn resolved_websocket_url(&self) -> Result<String, SyncError> {
        match &self.websocket_url {
            Some(explicit) => websocket_url_for(explicit),
            None => websocket_url_for(&self.backend_url),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backend_url: Option<String>,
    websocket_url: Option<String>,
    dedup_window_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_with(Path::new(DEFAULT_SETTINGS_FILE), |key| {
        std::env::var(key).ok()
    })
}

/// Defaults, then the toml file at `path` when present, then variables
/// resolved through `lookup`.
pub fn load_settings_with(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    match read_file_settings(path) {
        Ok(Some(file_cfg)) => apply_file_settings(&mut settings, file_cfg),
        Ok(None) => {}
        Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring settings file"),
    }

    if let Some(v) = lookup("CHAT_BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = lookup("APP__BACKEND_URL") {
        settings.backend_url = v;
    }

    if let Some(v) = lookup("CHAT_WEBSOCKET_URL") {
        settings.websocket_url = Some(v);
    }
    if let Some(v) = lookup("APP__WEBSOCKET_URL") {
        settings.websocket_url = Some(v);
    }

    override_number(&lookup, "APP__DEDUP_WINDOW_MS", &mut settings.dedup_window_ms);
    override_number(
        &lookup,
        "APP__REQUEST_TIMEOUT_MS",
        &mut settings.request_timeout_ms,
    );
    override_number(
        &lookup,
        "APP__RECONNECT_BASE_DELAY_MS",
        &mut settings.reconnect_base_delay_ms,
    );
    override_number(
        &lookup,
        "APP__RECONNECT_MAX_DELAY_MS",
        &mut settings.reconnect_max_delay_ms,
    );
    override_number(
        &lookup,
        "APP__RECONNECT_MAX_ATTEMPTS",
        &mut settings.reconnect_max_attempts,
    );

    settings
}

fn read_file_settings(path: &Path) -> Result<Option<FileSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = toml::from_str::<FileSettings>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.backend_url {
        settings.backend_url = v;
    }
    if let Some(v) = file_cfg.websocket_url {
        settings.websocket_url = Some(v);
    }
    if let Some(v) = file_cfg.dedup_window_ms {
        settings.dedup_window_ms = v;
    }
    if let Some(v) = file_cfg.request_timeout_ms {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect_max_attempts = v;
    }
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring invalid numeric override"),
    }
}

/// Maps an http(s) or ws(s) base url to the websocket base url.
pub fn websocket_url_for(base_url: &str) -> Result<String, SyncError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let mut url = Url::parse(trimmed).map_err(|err| SyncError::InvalidUrl {
        url: base_url.to_string(),
        reason: err.to_string(),
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl {
                url: base_url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    };
    url.set_scheme(scheme).map_err(|_| SyncError::InvalidUrl {
        url: base_url.to_string(),
        reason: format!("cannot switch scheme to '{scheme}'"),
    })?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
