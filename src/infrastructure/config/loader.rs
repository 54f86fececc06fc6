use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Invalid {field}: must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error(
        "Invalid backoff configuration: initial_delay_ms ({0}) must not exceed max_delay_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid backoff_multiplier: {0}. Must be at least 1.0")]
    InvalidMultiplier(f64),

    #[error("Invalid jitter range: [{0}, {1}]. Must satisfy 0 < min <= max")]
    InvalidJitter(f64, f64),

    #[error("Invalid {field}: {value}. Must be within [0, 1]")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .callsync/config.yaml (project config)
    /// 3. .callsync/local.yaml (project local overrides, optional)
    /// 4. Environment variables (CALLSYNC_* prefix, `__` between sections)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".callsync/config.yaml"))
            .merge(Yaml::file(".callsync/local.yaml"))
            .merge(Env::prefixed("CALLSYNC_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CALLSYNC_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let detection = &config.detection;
        if detection.poll_interval_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "detection.poll_interval_ms",
            });
        }
        if detection.lag_poll_interval_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "detection.lag_poll_interval_ms",
            });
        }
        if detection.max_detection_attempts == 0 {
            return Err(ConfigError::MustBePositive {
                field: "detection.max_detection_attempts",
            });
        }
        if detection.max_concurrent_detections == 0 {
            return Err(ConfigError::MustBePositive {
                field: "detection.max_concurrent_detections",
            });
        }

        let retry = &config.retry;
        if retry.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(retry.max_retries));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::InvalidBackoff(
                retry.initial_delay_ms,
                retry.max_delay_ms,
            ));
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(retry.backoff_multiplier));
        }
        if retry.jitter_min <= 0.0 || retry.jitter_min > retry.jitter_max {
            return Err(ConfigError::InvalidJitter(retry.jitter_min, retry.jitter_max));
        }
        if retry.per_attempt_timeout_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "retry.per_attempt_timeout_ms",
            });
        }
        if retry.max_concurrent_retries == 0 {
            return Err(ConfigError::MustBePositive {
                field: "retry.max_concurrent_retries",
            });
        }

        if config.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::MustBePositive {
                field: "circuit_breaker.failure_threshold",
            });
        }

        let sync = &config.sync;
        if sync.recent_event_capacity == 0 {
            return Err(ConfigError::MustBePositive {
                field: "sync.recent_event_capacity",
            });
        }
        if !(0.0..=1.0).contains(&sync.latency_smoothing) {
            return Err(ConfigError::OutOfUnitRange {
                field: "sync.latency_smoothing",
                value: sync.latency_smoothing,
            });
        }
        if !(0.0..=1.0).contains(&sync.critical_health_score) {
            return Err(ConfigError::OutOfUnitRange {
                field: "sync.critical_health_score",
                value: sync.critical_health_score,
            });
        }

        let machine = &config.state_machine;
        if machine.snapshot_history_capacity == 0 {
            return Err(ConfigError::MustBePositive {
                field: "state_machine.snapshot_history_capacity",
            });
        }
        if machine.transition_log_capacity == 0 {
            return Err(ConfigError::MustBePositive {
                field: "state_machine.transition_log_capacity",
            });
        }
        if machine.backgrounding_timeout_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "state_machine.backgrounding_timeout_ms",
            });
        }
        if !(0.0..=1.0).contains(&machine.error_rate_threshold) {
            return Err(ConfigError::OutOfUnitRange {
                field: "state_machine.error_rate_threshold",
                value: machine.error_rate_threshold,
            });
        }
        if machine.loop_threshold > machine.loop_window {
            return Err(ConfigError::ValidationFailed(format!(
                "state_machine.loop_threshold ({}) exceeds loop_window ({})",
                machine.loop_threshold, machine.loop_window
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(
                config.logging.rotation.clone(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SyncSource;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.detection.poll_interval_ms, 500);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
detection:
  presentation_lag_defect: true
  max_detection_attempts: 8
retry:
  max_retries: 3
  initial_delay_ms: 200
sync:
  source_priorities:
    backend: 90
logging:
  level: debug
  format: json
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert!(config.detection.presentation_lag_defect);
        assert_eq!(config.detection.max_detection_attempts, 8);
        assert_eq!(config.detection.poll_interval_ms, 500);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 200);
        assert_eq!(config.sync.priority_of(SyncSource::Backend), 90);
        assert_eq!(config.logging.format, "json");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_max_retries() {
        let mut config = Config::default();
        config.retry.max_retries = 0;

        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxRetries(0))
        ));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.retry.initial_delay_ms = 30_000;
        config.retry.max_delay_ms = 10_000;

        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(30_000, 10_000))
        ));
    }

    #[test]
    fn test_validate_jitter_and_ranges() {
        let mut config = Config::default();
        config.retry.jitter_min = 1.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidJitter(..))
        ));

        let mut config = Config::default();
        config.sync.latency_smoothing = 1.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::OutOfUnitRange { field: "sync.latency_smoothing", .. })
        ));

        let mut config = Config::default();
        config.detection.max_concurrent_detections = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MustBePositive { .. })
        ));

        let mut config = Config::default();
        config.state_machine.backgrounding_timeout_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::MustBePositive { field: "state_machine.backgrounding_timeout_ms" })
        ));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "retry:\n  max_retries: 7\ncircuit_breaker:\n  failure_threshold: 2"
        )
        .unwrap();

        temp_env::with_var("CALLSYNC_RETRY__MAX_RETRIES", Some("9"), || {
            let config = ConfigLoader::load_from_file(file.path()).unwrap();
            assert_eq!(config.retry.max_retries, 9);
            assert_eq!(config.circuit_breaker.failure_threshold, 2);
        });
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  format: xml").unwrap();

        temp_env::with_var_unset("CALLSYNC_LOGGING__FORMAT", || {
            assert!(ConfigLoader::load_from_file(file.path()).is_err());
        });
    }
}
