//! Server configuration: a JSON file loaded with `serde`/`shellexpand`
//! (grounded in the teacher's `eventlogger::read_config`), overridable by
//! a `clap`-derived CLI (grounded in `wudi-php-rs`'s `php-fpm.rs`).

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// How the server should acquire its listening socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum BindMode {
    /// Reuse a listening socket the parent process bound to fd 0.
    Inherited,
    /// Bind a Unix-domain socket at `path`.
    Unix { path: String },
}

/// Everything needed to run the server, independent of how it was
/// supplied (config file, CLI flags, or defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: BindMode,
    /// Octal umask applied only while binding a Unix socket.
    #[serde(default)]
    pub umask: Option<u32>,
    #[serde(default = "default_backlog")]
    pub listen_backlog: i32,
    #[serde(default)]
    pub min_workers: Option<usize>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_backlog() -> i32 {
    1000
}

fn default_max_workers() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: BindMode::Inherited,
            umask: None,
            listen_backlog: default_backlog(),
            min_workers: None,
            max_workers: default_max_workers(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file, expanding a leading `~` in
    /// `path` the same way `eventlogger::read_config` does.
    pub fn from_file(path: &str) -> anyhow::Result<ServerConfig> {
        let expanded = shellexpand::tilde(path).to_string();
        let data = fs::read_to_string(&expanded)?;
        let config: ServerConfig = serde_json::from_str(&data)?;
        Ok(config)
    }
}

/// Command-line overrides for [`ServerConfig`]. Flags take precedence
/// over the config file; the config file takes precedence over defaults.
#[derive(Debug, Parser)]
#[command(name = "minifcgi-server")]
#[command(about = "FastCGI protocol engine and WSGI-style gateway", long_about = None)]
pub struct Cli {
    /// Path to a JSON config file.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Bind a Unix-domain socket at this path instead of using the
    /// inherited fd-0 socket.
    #[arg(short = 's', long, conflicts_with = "inherited")]
    pub socket: Option<String>,

    /// Use the listening socket inherited on fd 0 (default when neither
    /// flag is given).
    #[arg(long, conflicts_with = "socket")]
    pub inherited: bool,

    /// Minimum number of worker threads to keep alive.
    #[arg(long)]
    pub min_workers: Option<usize>,

    /// Maximum number of worker threads.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Log level: off, error, warn, info, debug, trace.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Resolve a full [`ServerConfig`] from this CLI invocation: load the
    /// config file if `--config` was given (else start from defaults),
    /// then apply any flags on top.
    pub fn resolve(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path.to_string_lossy().as_ref())?,
            None => ServerConfig::default(),
        };

        if let Some(path) = &self.socket {
            config.bind = BindMode::Unix { path: path.clone() };
        } else if self.inherited {
            config.bind = BindMode::Inherited;
        }
        if let Some(n) = self.min_workers {
            config.min_workers = Some(n);
        }
        if let Some(n) = self.max_workers {
            config.max_workers = n;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}
