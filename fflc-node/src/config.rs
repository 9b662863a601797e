//! Load config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration. File: ~/.config/fflc/config.toml or /etc/fflc/config.toml.
/// Env overrides: FFLC_LISTEN_ADDR, FFLC_NODE_NAME, FFLC_WORKER_THREADS, FFLC_ROUND_DEADLINE_MS,
/// FFLC_PROPOSAL_LEAD_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener address (default 0.0.0.0:40000).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Local node id. Falls back to the public key in hex.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// How long a consensus round may stay open (default 1000 ms).
    #[serde(default = "default_round_deadline_ms")]
    pub round_deadline_ms: u64,
    /// How far ahead of now a locally posted event is stamped, so every replica receives the
    /// push before the round starts (default 500 ms).
    #[serde(default = "default_proposal_lead_ms")]
    pub proposal_lead_ms: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 40000))
}
fn default_worker_threads() -> usize {
    3
}
fn default_round_deadline_ms() -> u64 {
    1000
}
fn default_proposal_lead_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            node_name: None,
            worker_threads: default_worker_threads(),
            round_deadline_ms: default_round_deadline_ms(),
            proposal_lead_ms: default_proposal_lead_ms(),
        }
    }
}

impl Config {
    pub fn round_deadline(&self) -> Duration {
        Duration::from_millis(self.round_deadline_ms)
    }

    pub fn proposal_lead(&self) -> Duration {
        Duration::from_millis(self.proposal_lead_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

/// Load from an explicit path (`--config`), then env vars. A missing or invalid file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let c = toml::from_str::<Config>(&s)?;
    Ok(apply_env(c, |key| std::env::var(key).ok()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("FFLC_LISTEN_ADDR") {
        if let Ok(a) = s.parse::<SocketAddr>() {
            c.listen_addr = a;
        }
    }
    if let Some(s) = var("FFLC_NODE_NAME") {
        if !s.is_empty() {
            c.node_name = Some(s);
        }
    }
    if let Some(s) = var("FFLC_WORKER_THREADS") {
        if let Ok(n) = s.parse::<usize>() {
            if n > 0 {
                c.worker_threads = n;
            }
        }
    }
    if let Some(s) = var("FFLC_ROUND_DEADLINE_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.round_deadline_ms = ms;
        }
    }
    if let Some(s) = var("FFLC_PROPOSAL_LEAD_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.proposal_lead_ms = ms;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fflc/config.toml"));
    }
    out.push(PathBuf::from("/etc/fflc/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
