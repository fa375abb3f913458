//! Load config from file and environment.

use anyhow::{Context, Result};
use bagpipe_core::{Keypair, PublicKey};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration. File: ~/.config/bagpipe/config.toml or /etc/bagpipe/config.toml.
/// Env overrides: BAGPIPE_DAEMON_ADDR, BAGPIPE_KEYS_DIR, BAGPIPE_SYNC_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Daemon control address (default 127.0.0.1:5555).
    #[serde(default = "default_daemon_addr")]
    pub daemon_addr: String,
    /// Directory holding the `client` and `server.pub` key files.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Where added bags are stored unless `--dir` is given.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

fn default_daemon_addr() -> String {
    "127.0.0.1:5555".into()
}
fn default_keys_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".config/bagpipe/keys"),
        None => PathBuf::from("bagpipe-keys"),
    }
}
fn default_sync_interval_ms() -> u64 {
    150
}
fn default_query_timeout_ms() -> u64 {
    10_000
}
fn default_downloads_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join("Downloads"),
        None => PathBuf::from("downloads"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_addr: default_daemon_addr(),
            keys_dir: default_keys_dir(),
            sync_interval_ms: default_sync_interval_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            downloads_dir: default_downloads_dir(),
        }
    }
}

impl Config {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Our keypair and the daemon's pinned public key.
    pub fn load_keys(&self) -> Result<(Keypair, PublicKey)> {
        let client_path = self.keys_dir.join("client");
        let data = std::fs::read(&client_path)
            .with_context(|| format!("read {}", client_path.display()))?;
        let keypair = Keypair::from_key_file(&data)
            .with_context(|| format!("parse {}", client_path.display()))?;

        let server_path = self.keys_dir.join("server.pub");
        let data = std::fs::read(&server_path)
            .with_context(|| format!("read {}", server_path.display()))?;
        let daemon_key = PublicKey::from_key_file(&data)
            .with_context(|| format!("parse {}", server_path.display()))?;
        Ok((keypair, daemon_key))
    }
}

/// Load config: an explicit file must exist and parse; otherwise the first present
/// default location, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BAGPIPE_DAEMON_ADDR") {
        c.daemon_addr = s;
    }
    if let Some(s) = var("BAGPIPE_KEYS_DIR") {
        c.keys_dir = PathBuf::from(s);
    }
    if let Some(s) = var("BAGPIPE_SYNC_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.sync_interval_ms = ms;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bagpipe/config.toml"));
    }
    out.push(PathBuf::from("/etc/bagpipe/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}

fn read_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parse {}", path.display()))
}
