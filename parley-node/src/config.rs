//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{AudioQuality, UserId, VideoQuality};

/// Node configuration. File: ~/.config/parley/config.toml or /etc/parley/config.toml.
/// Env overrides: PARLEY_USER_ID, PARLEY_LISTEN_PORT, PARLEY_BIND_ADDRESS, PARLEY_DIRECTORY_URL,
/// PARLEY_ADVERTISE_ADDRESS, PARLEY_DOWNLOAD_DIR, PARLEY_AUTO_ANSWER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local user id as assigned by the directory service (default 0, unset).
    #[serde(default)]
    pub user_id: u64,
    /// Preferred P2P listen port (default 5000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Ports tried from `listen_port` upward before giving up (default 100).
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Directory service base URL. Empty disables registration and presence.
    #[serde(default)]
    pub directory_url: String,
    /// Address registered with the directory service (default: bind address).
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Entries idle this long are evicted while the directory poll fails. 0 disables.
    #[serde(default = "default_peer_ttl_secs")]
    pub peer_ttl_secs: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Concurrent inbound connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_audio_quality")]
    pub audio_quality: AudioQuality,
    #[serde(default = "default_video_quality")]
    pub video_quality: VideoQuality,
    /// Accept every incoming call.
    #[serde(default)]
    pub auto_answer: bool,
}

fn default_listen_port() -> u16 {
    5000
}
fn default_port_attempts() -> u16 {
    100
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_poll_secs() -> u64 {
    8
}
fn default_peer_ttl_secs() -> u64 {
    120
}
fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("Downloads/parley")
}
fn default_max_connections() -> usize {
    64
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_read_timeout_ms() -> u64 {
    10_000
}
fn default_join_timeout_ms() -> u64 {
    1_000
}
fn default_audio_quality() -> AudioQuality {
    AudioQuality::Medium
}
fn default_video_quality() -> VideoQuality {
    VideoQuality::Medium
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: 0,
            listen_port: default_listen_port(),
            port_attempts: default_port_attempts(),
            bind_address: default_bind_address(),
            directory_url: String::new(),
            advertise_address: None,
            heartbeat_secs: default_heartbeat_secs(),
            poll_secs: default_poll_secs(),
            peer_ttl_secs: default_peer_ttl_secs(),
            download_dir: default_download_dir(),
            max_connections: default_max_connections(),
            call_timeout_secs: default_call_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            audio_quality: default_audio_quality(),
            video_quality: default_video_quality(),
            auto_answer: false,
        }
    }
}

impl Config {
    pub fn user(&self) -> UserId {
        UserId(self.user_id)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }

    /// None when local eviction is disabled.
    pub fn peer_ttl(&self) -> Option<Duration> {
        (self.peer_ttl_secs > 0).then(|| Duration::from_secs(self.peer_ttl_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Address to hand the directory service. A wildcard bind is not reachable, so fall back
    /// to loopback in that case.
    pub fn advertised_address(&self) -> String {
        match &self.advertise_address {
            Some(a) if !a.is_empty() => a.clone(),
            _ if self.bind_address == "0.0.0.0" || self.bind_address == "::" => {
                "127.0.0.1".to_string()
            }
            _ => self.bind_address.clone(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(id) = get("PARLEY_USER_ID").and_then(|s| s.parse().ok()) {
        c.user_id = id;
    }
    if let Some(p) = get("PARLEY_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = get("PARLEY_BIND_ADDRESS") {
        c.bind_address = s;
    }
    if let Some(s) = get("PARLEY_DIRECTORY_URL") {
        c.directory_url = s;
    }
    if let Some(s) = get("PARLEY_ADVERTISE_ADDRESS") {
        c.advertise_address = Some(s);
    }
    if let Some(s) = get("PARLEY_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(b) = get("PARLEY_AUTO_ANSWER").and_then(|s| s.parse().ok()) {
        c.auto_answer = b;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/parley/config.toml"));
    }
    out.push(PathBuf::from("/etc/parley/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            log::warn!("ignoring config {}: {}", path.display(), e);
            None
        }
    }
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&s)?)
}
