//! Load daemon config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use kubo_core::NodeOptions;

/// Daemon configuration. File: ~/.config/kubo/config.toml or /etc/kubo/config.toml.
/// Env overrides: KUBO_REPO_PATH, KUBO_ONLINE, KUBO_ENABLE_PUBSUB, KUBO_POLL_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Repository directory. Unset runs on a temporary repository.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub online: bool,
    #[serde(default = "default_true")]
    pub enable_pubsub: bool,
    /// Pubsub poll interval in milliseconds (default 100).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Topics whose messages are logged.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Local services exposed over p2p.
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Protocol name.
    pub name: String,
    /// Loopback TCP port the protocol is forwarded to.
    pub port: u16,
}

fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_path: None,
            online: true,
            enable_pubsub: true,
            poll_interval_ms: default_poll_interval_ms(),
            topics: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

impl Config {
    pub fn node_options(&self) -> NodeOptions {
        let mut opts = NodeOptions::ephemeral(self.online, self.enable_pubsub)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)));
        if let Some(repo) = &self.repo_path {
            opts = opts.with_repo(repo);
        }
        opts
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |k| std::env::var(k).ok())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("KUBO_REPO_PATH") {
        if !s.is_empty() {
            c.repo_path = Some(PathBuf::from(s));
        }
    }
    if let Some(b) = var("KUBO_ONLINE").as_deref().and_then(parse_bool) {
        c.online = b;
    }
    if let Some(b) = var("KUBO_ENABLE_PUBSUB").as_deref().and_then(parse_bool) {
        c.enable_pubsub = b;
    }
    if let Some(ms) = var("KUBO_POLL_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok()) {
        c.poll_interval_ms = ms;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/kubo/config.toml"));
    }
    out.push(PathBuf::from("/etc/kubo/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}
