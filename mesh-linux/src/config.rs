//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Node configuration. File: ~/.config/meshchat/config.toml or /etc/meshchat/config.toml.
/// Env overrides: MESHCHAT_DISCOVERY_PORT, MESHCHAT_TRANSPORT_PORT, MESHCHAT_DISPLAY_NAME,
/// MESHCHAT_INVITE_TIMEOUT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Peer link TCP port (default 45681). Advertised in beacons.
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Name shown to other devices on first run. Defaults to the hostname.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Seconds an invitation stays open (default 30).
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub advertise_on_start: bool,
    #[serde(default = "default_true")]
    pub browse_on_start: bool,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_invite_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            display_name: None,
            invite_timeout_secs: default_invite_timeout_secs(),
            advertise_on_start: true,
            browse_on_start: true,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("MESHCHAT_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("MESHCHAT_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transport_port = p;
    }
    if let Some(name) = var("MESHCHAT_DISPLAY_NAME").filter(|s| !s.trim().is_empty()) {
        c.display_name = Some(name);
    }
    if let Some(t) = var("MESHCHAT_INVITE_TIMEOUT").and_then(|s| s.parse::<u64>().ok()) {
        c.invite_timeout_secs = t;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring bad config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
