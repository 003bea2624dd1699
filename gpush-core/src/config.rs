//! Configuration: user defaults from an XDG config file, overridden by
//! per-repository git config.
//!
//! File parse failures are soft — a broken config file degrades to
//! defaults with a note on stderr, it never aborts a run. Git config
//! values win over the file so per-repository overrides behave the way
//! git users expect.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

/// Raw shape of `config.toml`. All fields optional; unknown keys are
/// ignored.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    remote: Option<String>,
    gc_interval_days: Option<u64>,
    updater: Option<String>,
}

/// Effective configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the git remote pointing at the review server.
    pub remote: String,
    /// Minimum time between garbage-collection passes.
    pub gc_interval: Duration,
    /// Identity string recorded in the staged ledger header, when set.
    pub updater: Option<String>,
}

const DEFAULT_REMOTE: &str = "gerrit";
const DEFAULT_GC_INTERVAL_DAYS: u64 = 30;

impl Default for Config {
    fn default() -> Self {
        Config {
            remote: DEFAULT_REMOTE.to_owned(),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_DAYS * 24 * 3600),
            updater: None,
        }
    }
}

/// Returns the path to the gpush config file.
///
/// Prefers `$XDG_CONFIG_HOME/gpush/config.toml`; falls back to
/// `~/.config/gpush/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("gpush").join("config.toml")
}

fn load_file() -> FileConfig {
    let path = config_path();
    let raw = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(_) => return FileConfig::default(),
    };
    match toml::from_str(&raw) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("gpush: config parse error in {:?}: {}", path, e);
            FileConfig::default()
        }
    }
}

impl Config {
    /// Builds the effective configuration: defaults, then the config
    /// file, then git config (`gpush.remote`, `gpush.gcinterval` in days,
    /// `gpush.updater`).
    pub fn load(repo: &git2::Repository) -> Config {
        let file = load_file();
        let mut cfg = Config::default();
        if let Some(remote) = file.remote {
            cfg.remote = remote;
        }
        if let Some(days) = file.gc_interval_days {
            cfg.gc_interval = Duration::from_secs(days * 24 * 3600);
        }
        cfg.updater = file.updater;

        match repo.config() {
            Ok(git_cfg) => {
                if let Ok(remote) = git_cfg.get_string("gpush.remote") {
                    cfg.remote = remote;
                }
                if let Ok(days) = git_cfg.get_i64("gpush.gcinterval") {
                    if days >= 0 {
                        cfg.gc_interval = Duration::from_secs(days as u64 * 24 * 3600);
                    } else {
                        warn!("ignoring negative gpush.gcinterval");
                    }
                }
                if let Ok(updater) = git_cfg.get_string("gpush.updater") {
                    cfg.updater = Some(updater);
                }
            }
            Err(e) => debug!("no git config: {}", e),
        }
        cfg
    }
}
