//! Process-wide configuration (spec.md §6 "Configuration"): store
//! connection, input stream/group, default queue length, circuit-breaker
//! defaults, backpressure thresholds, health check interval/timeout, and
//! trace sampling rate. Loaded once at startup by [`Cli::load`] and handed
//! around as `Arc<Config>` thereafter (spec.md §5 "no global mutable
//! configuration beyond the loaded settings object").

use std::path::{Path, PathBuf};

use clap::Parser;
use frame_logger_config::LoggerConfig;
use frame_metrics_config::MetricsConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub input_stream: String,
    pub input_group: String,
    pub default_queue_maxlen: u64,
    pub dead_letter_stream: String,
    pub max_redelivery_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            input_stream: "frames:captured".to_string(),
            input_group: "frame-buffer-group".to_string(),
            default_queue_maxlen: 10_000,
            dead_letter_stream: "frames:dead-letter".to_string(),
            max_redelivery_attempts: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
    pub call_timeout_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
            success_threshold: 2,
            call_timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub low: f64,
    pub high: f64,
    pub critical: f64,
    pub adaptive: bool,
    pub per_queue_throttling: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            low: 0.6,
            high: 0.8,
            critical: 0.95,
            adaptive: false,
            per_queue_throttling: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            check_interval_secs: 10,
            timeout_ms: 2_000,
            failure_threshold: 3,
            recovery_timeout_secs: 60,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub sampling_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig { sampling_rate: 1.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub enabled: bool,
    pub max_age_secs: u64,
    pub starvation_threshold: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            enabled: false,
            max_age_secs: 60,
            starvation_threshold: 10,
        }
    }
}

/// The full settings object, assembled once at startup and treated as
/// immutable thereafter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logger: LoggerConfig,
    pub metrics: MetricsConfig,
    pub store: StoreConfig,
    pub stream: StreamConfig,
    pub breaker: BreakerConfig,
    pub backpressure: BackpressureConfig,
    pub health: HealthConfig,
    pub tracing: TracingConfig,
    pub admission: AdmissionConfig,
    /// `None` lets `frame-async-runtime` pick the host's core count.
    pub worker_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logger: LoggerConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
            stream: StreamConfig::default(),
            breaker: BreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
            health: HealthConfig::default(),
            tracing: TracingConfig::default(),
            admission: AdmissionConfig::default(),
            worker_threads: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Loads a TOML file, falling back to defaults field-by-field for
    /// anything the file omits (every section derives `#[serde(default)]`).
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// CLI surface, matching the teacher's `AppConfig::load_for_subcommand`
/// pattern adapted to this binary's single `run` subcommand: there is no
/// miner/import/export analogue here, only the orchestrator's main loop.
#[derive(Parser, Debug)]
#[command(name = "frame-orchestrator", about = "Frame orchestrator core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Runs the orchestrator's main loop until a shutdown signal arrives.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Path to a TOML config file; when absent, every setting uses its
    /// built-in default.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Overrides `store.url` from the config file.
    #[arg(long)]
    pub store_url: Option<String>,
}

impl Cli {
    /// Parses `std::env::args()` and loads the resulting [`Config`],
    /// applying any CLI overrides on top of the file (or defaults).
    pub fn load() -> Result<Config, ConfigError> {
        let cli = Cli::parse();
        let Command::Run(args) = cli.command;
        args.resolve()
    }
}

impl RunArgs {
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load_from_file(path)?,
            None => Config::default(),
        };
        if let Some(url) = &self.store_url {
            config.store.url = url.clone();
        }
        Ok(config)
    }
}
