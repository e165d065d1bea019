//! Logger configuration loaded as part of the process-wide [`frame_config`]
//! settings object.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// `env_logger`-style filter string, e.g. `"info,frame_router=debug"`.
    pub filter: Option<String>,
    pub color: bool,
    pub log_to_stdout: bool,
    pub log_to_file: bool,
    /// File name relative to `log_dir`.
    pub file: PathBuf,
    pub log_dir: PathBuf,
    /// Additional named loggers with their own filter, each writing to
    /// `log_dir/<name>.log`.
    pub extra: HashMap<String, ExtraLoggerConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            filter: Some("info".to_string()),
            color: true,
            log_to_stdout: true,
            log_to_file: false,
            file: PathBuf::from("orchestrator.log"),
            log_dir: PathBuf::from("logs"),
            extra: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraLoggerConfig {
    pub filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_info() {
        assert_eq!(LoggerConfig::default().filter.as_deref(), Some("info"));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut extra = HashMap::new();
        extra.insert(
            "hyper".to_string(),
            ExtraLoggerConfig {
                filter: "warn".into(),
            },
        );
        let cfg = LoggerConfig {
            filter: Some("debug".into()),
            color: false,
            log_to_stdout: true,
            log_to_file: true,
            file: PathBuf::from("orchestrator.log"),
            log_dir: PathBuf::from("/tmp/orchestrator-logs"),
            extra,
        };
        let toml_str = toml::to_string(&cfg).unwrap();
        let parsed: LoggerConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
    }
}
