//! Alerting service configuration
//!
//! Loaded in layers, later sources overriding earlier ones:
//!
//! 1. Compiled defaults (`Default` impls below)
//! 2. TOML file at `VIGIL_CONFIG` (default `config/vigil.toml`), optional
//! 3. `VIGIL__*` environment variables, `__` separating nested keys
//!    (e.g. `VIGIL__EVALUATION__EVALUATE_INTERVAL=5s`)
//!
//! Durations accept the strings understood by
//! [`vigil_shared::utils::parse_duration`] or a bare number of seconds.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/vigil.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Admin HTTP listen address (health checks, metrics, condition status)
    pub admin_addr: String,

    /// Log output format
    pub log_format: LogFormat,

    pub evaluation: EvaluationConfig,

    pub stream: StreamSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

/// Policy knobs shared by every condition evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Tick period of the evaluate loop and of subscription bootstrap retries
    #[serde(with = "duration_str")]
    pub evaluate_interval: Duration,

    /// How long an agent may stay disconnected before the disconnect alert fires
    #[serde(with = "duration_str")]
    pub disconnect_threshold: Duration,

    /// How long capabilities may stay unhealthy before the capability alert fires
    #[serde(with = "duration_str")]
    pub capability_threshold: Duration,

    /// How long a condition must have been healthy before a firing alert resolves
    #[serde(with = "duration_str")]
    pub resolve_debounce: Duration,

    /// Cached state timestamps closer than this are not rewritten
    #[serde(with = "duration_str")]
    pub state_tolerance: Duration,

    /// Capacity of each evaluator's inbound message channel
    pub inbound_buffer: usize,
}

/// Shared ingress stream carrying agent health telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub name: String,

    /// First subject token; the stream captures `<prefix>.>`
    pub subject_prefix: String,

    /// Retained messages before the oldest are discarded
    pub max_messages: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            admin_addr: "0.0.0.0:9090".to_string(),
            log_format: LogFormat::Text,
            evaluation: EvaluationConfig::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            evaluate_interval: Duration::from_secs(10),
            disconnect_threshold: Duration::from_secs(10 * 60),
            capability_threshold: Duration::from_secs(10 * 60),
            resolve_debounce: Duration::ZERO,
            state_tolerance: Duration::from_secs(1),
            inbound_buffer: 256,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "AGENT_HEALTH".to_string(),
            subject_prefix: "agent-health".to_string(),
            max_messages: 100_000,
        }
    }
}

impl AlertingConfig {
    /// Load from `path` (or `VIGIL_CONFIG`, or the default path) plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("VIGIL_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("VIGIL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let eval = &self.evaluation;
        if eval.evaluate_interval.is_zero() {
            anyhow::bail!("evaluate_interval must be greater than 0");
        }
        for (name, threshold) in [
            ("disconnect_threshold", eval.disconnect_threshold),
            ("capability_threshold", eval.capability_threshold),
        ] {
            if eval.evaluate_interval >= threshold {
                anyhow::bail!(
                    "evaluate_interval ({:?}) must be shorter than {} ({:?})",
                    eval.evaluate_interval,
                    name,
                    threshold
                );
            }
        }
        if eval.inbound_buffer == 0 {
            anyhow::bail!("inbound_buffer must be greater than 0");
        }
        if self.stream.name.is_empty() || self.stream.subject_prefix.is_empty() {
            anyhow::bail!("stream name and subject_prefix must not be empty");
        }
        if self.stream.subject_prefix.contains(['.', '*', '>']) {
            anyhow::bail!(
                "subject_prefix must be a single literal token: {}",
                self.stream.subject_prefix
            );
        }
        Ok(())
    }
}

/// Serde adapter for human-readable durations
mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() == 0 {
            s.serialize_str(&format!("{}s", d.as_secs()))
        } else {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => vigil_shared::utils::parse_duration(&text)
                .map_err(|e| de::Error::custom(format!("invalid duration {:?}: {}", text, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AlertingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.evaluation.resolve_debounce, Duration::ZERO);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
admin_addr = "127.0.0.1:19090"
log_format = "json"

[evaluation]
evaluate_interval = "500ms"
disconnect_threshold = "2m"
capability_threshold = 90

[stream]
name = "HEALTH"
"#
        )
        .unwrap();

        let config = AlertingConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.admin_addr, "127.0.0.1:19090");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.evaluation.evaluate_interval, Duration::from_millis(500));
        assert_eq!(config.evaluation.disconnect_threshold, Duration::from_secs(120));
        assert_eq!(config.evaluation.capability_threshold, Duration::from_secs(90));
        // untouched fields keep their defaults
        assert_eq!(config.evaluation.inbound_buffer, 256);
        assert_eq!(config.stream.name, "HEALTH");
        assert_eq!(config.stream.subject_prefix, "agent-health");
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AlertingConfig::load(Some("/nonexistent/vigil.toml")).unwrap();
        assert_eq!(config.stream.name, "AGENT_HEALTH");
    }

    #[test]
    fn test_validation_rejects_interval_longer_than_threshold() {
        let mut config = AlertingConfig::default();
        config.evaluation.evaluate_interval = Duration::from_secs(600);
        assert!(config.validate().is_err());

        let mut config = AlertingConfig::default();
        config.evaluation.evaluate_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = AlertingConfig::default();
        config.stream.subject_prefix = "agent.health".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serializes_durations_as_strings() {
        let rendered = toml::to_string(&AlertingConfig::default()).unwrap();
        assert!(rendered.contains(r#"evaluate_interval = "10s""#));
    }
}
