//! Metrics configuration loaded as part of the process-wide [`frame_config`]
//! settings object.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to register the `prometheus`-backed implementation. When
    /// `false`, the binary wires `frame_metrics::NoopMetrics` instead.
    pub enabled: bool,
    /// Namespace prefix documented for operators; not applied to metric
    /// names here since every name is already `frame_buffer_`-prefixed to
    /// match the original implementation's metric names.
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            namespace: "frame_buffer".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_enabled() {
        assert!(MetricsConfig::default().enabled);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = MetricsConfig {
            enabled: false,
            namespace: "custom".to_string(),
        };
        let toml_str = toml::to_string(&cfg).unwrap();
        let parsed: MetricsConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
    }
}
