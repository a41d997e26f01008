/*!
 * Configuration
 *
 * Settings come from four layers. Command-line flags win over the JSON
 * config file, the file wins over `TINYREDIS_*` environment variables,
 * and anything left unset keeps its default.
 */

use crate::aof::FsyncPolicy;
use crate::error::ConfigError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Default)]
#[command(name = "tinyredis")]
#[command(about = "An embedded Redis-like key-value server with snapshot and append-log durability")]
#[command(version)]
pub struct Cli {
    /// Host to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Snapshot file path
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Append-only log path
    #[arg(long)]
    pub aof: Option<PathBuf>,

    /// Run without the append-only log
    #[arg(long)]
    pub no_aof: bool,

    /// When appended records are synced to disk
    #[arg(long, value_enum)]
    pub fsync: Option<FsyncPolicy>,

    /// Seconds between automatic checkpoints, 0 disables them
    #[arg(long)]
    pub checkpoint_interval: Option<u64>,

    /// Configuration file path (JSON format)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// Server and durability settings.
///
/// Precedence: CLI > File > Environment > Defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub snapshot_path: PathBuf,
    pub aof_path: PathBuf,
    pub aof_enabled: bool,
    pub fsync: FsyncPolicy,
    pub checkpoint_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            snapshot_path: PathBuf::from("dump.json"),
            aof_path: PathBuf::from("appendonly.aof"),
            aof_enabled: true,
            fsync: FsyncPolicy::Always,
            checkpoint_interval_secs: 60,
        }
    }
}

/// Paths and policies the shard needs to load, log and checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    pub snapshot_path: PathBuf,
    /// `None` runs without the append-only log
    pub aof_path: Option<PathBuf>,
    pub fsync: FsyncPolicy,
    /// `None` disables automatic checkpoints
    pub checkpoint_interval: Option<Duration>,
}

impl PersistenceConfig {
    /// Snapshot and log side by side in `dir`, checkpoints disabled
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            snapshot_path: dir.join("dump.json"),
            aof_path: Some(dir.join("appendonly.aof")),
            fsync: FsyncPolicy::Always,
            checkpoint_interval: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            field: name,
            reason: format!("cannot parse '{}'", raw),
        }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Defaults overridden by `TINYREDIS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("TINYREDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("TINYREDIS_PORT")? {
            config.port = port;
        }
        if let Ok(path) = std::env::var("TINYREDIS_SNAPSHOT") {
            config.snapshot_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("TINYREDIS_AOF") {
            config.aof_path = PathBuf::from(path);
        }
        if let Some(enabled) = env_parse("TINYREDIS_AOF_ENABLED")? {
            config.aof_enabled = enabled;
        }
        match std::env::var("TINYREDIS_FSYNC").as_deref() {
            Ok("always") => config.fsync = FsyncPolicy::Always,
            Ok("everysec") => config.fsync = FsyncPolicy::Everysec,
            Ok(other) => {
                return Err(ConfigError::Invalid {
                    field: "TINYREDIS_FSYNC",
                    reason: format!("expected 'always' or 'everysec', got '{}'", other),
                })
            }
            Err(_) => {}
        }
        if let Some(secs) = env_parse("TINYREDIS_CHECKPOINT_INTERVAL")? {
            config.checkpoint_interval_secs = secs;
        }

        Ok(config)
    }

    /// Overlay the fields present in a JSON config file; fields it omits
    /// keep their current value.
    pub fn merge_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let overrides: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let mut merged = serde_json::to_value(&self)?;
        if let Some(fields) = merged.as_object_mut() {
            fields.extend(overrides);
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Merge every source in precedence order
    pub fn from_sources(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Self::from_env()?;
        if let Some(path) = &cli.config {
            config = config.merge_file(path)?;
        }
        Ok(config.with_cli(cli))
    }

    fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(path) = &cli.snapshot {
            self.snapshot_path = path.clone();
        }
        if let Some(path) = &cli.aof {
            self.aof_path = path.clone();
        }
        if cli.no_aof {
            self.aof_enabled = false;
        }
        if let Some(fsync) = cli.fsync {
            self.fsync = fsync;
        }
        if let Some(secs) = cli.checkpoint_interval {
            self.checkpoint_interval_secs = secs;
        }
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            snapshot_path: self.snapshot_path.clone(),
            aof_path: self.aof_enabled.then(|| self.aof_path.clone()),
            fsync: self.fsync,
            checkpoint_interval: (self.checkpoint_interval_secs > 0)
                .then(|| Duration::from_secs(self.checkpoint_interval_secs)),
        }
    }
}
