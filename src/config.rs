//! Configuration loading.
//!
//! Settings come from a JSON file (explicit `--config` path, or
//! `<config dir>/mixbridge/config.json` when present), then environment
//! variables override individual values. Missing fields take defaults, so
//! a config file only needs the values it changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Relay-side settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// WebSocket URL of the local mix client.
    pub mixnet_url: String,
    /// Relay opened for payloads that arrive without a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_relay_url: Option<String>,
    /// Seconds allowed for a downstream WebSocket handshake.
    pub connect_timeout_secs: u64,
    /// Seconds allowed for a one-shot HTTP call.
    pub http_timeout_secs: u64,
    /// Largest HTTP response body accepted, in bytes.
    pub max_http_body_bytes: usize,
    /// Seconds a per-tag worker may sit idle before it is retired.
    pub worker_idle_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mixnet_url: "ws://127.0.0.1:1978".to_string(),
            default_relay_url: Some("wss://staging.relay.walletconnect.com".to_string()),
            connect_timeout_secs: 30,
            http_timeout_secs: 30,
            max_http_body_bytes: 4 * 1024 * 1024,
            worker_idle_secs: 300,
        }
    }
}

impl ProviderConfig {
    /// Downstream handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// HTTP call timeout.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Worker idle timeout.
    pub fn worker_idle(&self) -> Duration {
        Duration::from_secs(self.worker_idle_secs)
    }
}

/// Client-side settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the local mix client.
    pub mixnet_url: String,
    /// Mix address of the service provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_address: Option<String>,
    /// Reply blocks attached to each message.
    pub reply_surbs: u32,
    /// Seconds to wait for a correlated reply.
    pub call_timeout_secs: u64,
    /// Seconds to wait for `opened` on each attempt.
    pub open_timeout_secs: u64,
    /// Extra open attempts after the first times out.
    pub open_retries: u32,
    /// Seconds to wait for `closed`.
    pub close_timeout_secs: u64,
    /// Milliseconds between sweeps for expired calls.
    pub reaper_interval_ms: u64,
    /// Ping the provider with a test call when opening an HTTP relay.
    pub provider_ping: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mixnet_url: "ws://127.0.0.1:1977".to_string(),
            provider_address: None,
            reply_surbs: 5,
            call_timeout_secs: 30,
            open_timeout_secs: 30,
            open_retries: 2,
            close_timeout_secs: 10,
            reaper_interval_ms: 1000,
            provider_ping: true,
        }
    }
}

impl ClientConfig {
    /// Correlated call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Per-attempt open deadline.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// Close acknowledgement deadline.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Reaper sweep period.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

/// Complete configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Relay-side settings.
    pub provider: ProviderConfig,
    /// Client-side settings.
    pub client: ClientConfig,
}

impl Config {
    /// Platform config directory for mixbridge (not created).
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("mixbridge"))
    }

    /// Load from `path`, or from the default location when `None`, then
    /// apply environment overrides.
    ///
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Self::config_dir()?.join("config.json");
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("MIXBRIDGE_PROVIDER_MIXNET_URL") {
            self.provider.mixnet_url = url;
        }
        if let Some(url) = lookup("MIXBRIDGE_DEFAULT_RELAY_URL") {
            // Empty disables auto-open.
            self.provider.default_relay_url = (!url.is_empty()).then_some(url);
        }
        if let Some(url) = lookup("MIXBRIDGE_CLIENT_MIXNET_URL") {
            self.client.mixnet_url = url;
        }
        if let Some(address) = lookup("MIXBRIDGE_PROVIDER_ADDRESS") {
            self.client.provider_address = Some(address);
        }
        if let Some(surbs) = parse_override(&lookup, "MIXBRIDGE_REPLY_SURBS") {
            self.client.reply_surbs = surbs;
        }
        if let Some(secs) = parse_override(&lookup, "MIXBRIDGE_CALL_TIMEOUT") {
            self.client.call_timeout_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, "MIXBRIDGE_OPEN_TIMEOUT") {
            self.client.open_timeout_secs = secs;
        }
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring {key}={raw:?}: not a number");
            None
        }
    }
}
