//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chatlink_core::Framing;
use tracing::{debug, warn};

use crate::worker::WorkerSettings;

/// Daemon configuration. File: ~/.config/chatlink/config.toml or /etc/chatlink/config.toml.
/// Env overrides: CHATLINK_LISTEN_PORT, CHATLINK_DISPLAY_NAME, CHATLINK_DOWNLOAD_DIR, CHATLINK_FRAMING.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the listener binds (default 0.0.0.0).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    /// Listener TCP port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Name announced to peers and used as author of local messages.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// `legacy` (raw chunks) or `length-prefixed`. Both ends must agree.
    #[serde(default)]
    pub framing: Framing,
    /// Bytes per read (default 1024).
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_delay_ms")]
    pub file_start_delay_ms: u64,
    #[serde(default = "default_delay_ms")]
    pub history_spacing_ms: u64,
    /// Start listening for inbound peers (default true).
    #[serde(default = "default_server")]
    pub server: bool,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_listen_port() -> u16 {
    45680
}
fn default_display_name() -> String {
    std::env::var("USER")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "chatlink".to_string())
}
fn default_download_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads/chatlink"),
        None => PathBuf::from("received"),
    }
}
fn default_read_chunk_size() -> usize {
    1024
}
fn default_delay_ms() -> u64 {
    100
}
fn default_server() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            display_name: default_display_name(),
            download_dir: default_download_dir(),
            framing: Framing::default(),
            read_chunk_size: default_read_chunk_size(),
            file_start_delay_ms: default_delay_ms(),
            history_spacing_ms: default_delay_ms(),
            server: default_server(),
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            framing: self.framing,
            read_chunk_size: self.read_chunk_size.max(1),
            file_start_delay: Duration::from_millis(self.file_start_delay_ms),
            history_spacing: Duration::from_millis(self.history_spacing_ms),
        }
    }
}

/// Load config: default, then config file (explicit path, or the first that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let file = match explicit {
        Some(p) => load_path(p),
        None => config_paths().into_iter().find(|p| p.exists()).and_then(|p| load_path(&p)),
    };
    let mut c = file.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply CHATLINK_* overrides; values that do not parse are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("CHATLINK_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = var("CHATLINK_DISPLAY_NAME") {
        if !s.is_empty() {
            c.display_name = s;
        }
    }
    if let Some(s) = var("CHATLINK_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = var("CHATLINK_FRAMING") {
        if let Ok(f) = s.parse::<Framing>() {
            c.framing = f;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/chatlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/chatlink/config.toml"));
    out
}

fn load_path(p: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(p) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %p.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => {
            debug!(path = %p.display(), "config loaded");
            Some(c)
        }
        Err(e) => {
            warn!(path = %p.display(), error = %e, "invalid config file; using defaults");
            None
        }
    }
}
