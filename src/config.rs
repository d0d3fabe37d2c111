use anyhow::{Context, Result};
use nostr::nips::nip19::{FromBech32, ToBech32};
use nostr::{Keys, SecretKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::webrtc::DEFAULT_OPEN_TIMEOUT;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name announced in presence. Generated when unset.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// Presence scope shared by all peers
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Presence heartbeat interval
    #[serde(default = "default_hello_interval_ms")]
    pub hello_interval_ms: u64,
    /// A peer not heard from for this long is considered gone
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// How long a subscription waits for at least one relay
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    /// Largest frame sent or accepted, metadata included
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub auto_accept: bool,
}

/// Exponential backoff for subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://relay.snort.social".to_string(),
        "wss://temp.iris.to".to_string(),
    ]
}

fn default_scope() -> String {
    crate::relay::DEFAULT_SCOPE.to_string()
}

fn default_hello_interval_ms() -> u64 {
    10_000
}

fn default_peer_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_open_timeout_ms() -> u64 {
    DEFAULT_OPEN_TIMEOUT.as_millis() as u64
}

fn default_download_dir() -> String {
    dirs::download_dir()
        .unwrap_or_else(|| get_peerdrop_dir().join("downloads"))
        .to_string_lossy()
        .to_string()
}

fn default_max_frame_bytes() -> usize {
    crate::framing::DEFAULT_MAX_FRAME_LEN
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            scope: default_scope(),
            hello_interval_ms: default_hello_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_frame_bytes: default_max_frame_bytes(),
            auto_accept: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay after the given failed attempt (1-based), doubling up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Config {
    /// Load config from the default path, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&get_config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load config from `path`, falling back to defaults if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply PEERDROP_* overrides from `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("PEERDROP_NAME").filter(|v| !v.trim().is_empty()) {
            self.identity.name = Some(name.trim().to_string());
        }
        if let Some(relays) = lookup("PEERDROP_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !relays.is_empty() {
                self.signaling.relays = relays;
            }
        }
        if let Some(dir) = lookup("PEERDROP_DOWNLOAD_DIR").filter(|v| !v.is_empty()) {
            self.transfer.download_dir = dir;
        }
        if let Some(scope) = lookup("PEERDROP_SCOPE").filter(|v| !v.is_empty()) {
            self.signaling.scope = scope;
        }
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.signaling.hello_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling.peer_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling.connect_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.webrtc.open_timeout_ms)
    }

    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(&self.transfer.download_dir)
    }
}

/// Get the peerdrop directory (~/.peerdrop)
pub fn get_peerdrop_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerdrop")
}

/// Get the config file path (~/.peerdrop/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerdrop_dir().join("config.toml")
}

/// Get the nsec file path (~/.peerdrop/nsec)
pub fn get_nsec_path() -> PathBuf {
    get_peerdrop_dir().join("nsec")
}

/// Relay signing keys at `path`, generated and saved on first use.
/// Returns (Keys, was_generated)
pub fn ensure_keys_at(path: &Path) -> Result<(Keys, bool)> {
    if path.exists() {
        let nsec = fs::read_to_string(path).context("Failed to read nsec file")?;
        let secret_key = SecretKey::from_bech32(nsec.trim()).context("Invalid nsec format")?;
        return Ok((Keys::new(secret_key), false));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let keys = Keys::generate();
    let nsec = keys.secret_key().to_bech32().context("Failed to encode nsec")?;
    fs::write(path, &nsec)?;

    // Owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok((keys, true))
}
