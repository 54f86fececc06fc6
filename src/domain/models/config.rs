use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sync::SyncSource;

/// Main configuration structure for callsync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Native call UI detection
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Retry orchestration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retry circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Multi-source state synchronization
    #[serde(default)]
    pub sync: SyncConfig,

    /// Call UI state machine
    #[serde(default)]
    pub state_machine: StateMachineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Detection engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DetectionConfig {
    /// Polling interval on platforms without the presentation-lag defect
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Shorter polling interval used when the platform lags presenting the native UI
    #[serde(default = "default_lag_poll_interval_ms")]
    pub lag_poll_interval_ms: u64,

    /// Whether the running platform has the presentation-lag defect
    #[serde(default)]
    pub presentation_lag_defect: bool,

    /// Upper bound on a single detection session
    #[serde(default = "default_max_detection_duration_ms")]
    pub max_detection_duration_ms: u64,

    /// Upper bound on polling ticks per session
    #[serde(default = "default_max_detection_attempts")]
    pub max_detection_attempts: u32,

    /// Maximum concurrently monitored calls
    #[serde(default = "default_max_concurrent_detections")]
    pub max_concurrent_detections: usize,

    /// How long new sessions are refused after a memory-pressure signal
    #[serde(default = "default_memory_pressure_window_ms")]
    pub memory_pressure_window_ms: u64,
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_lag_poll_interval_ms() -> u64 {
    250
}

const fn default_max_detection_duration_ms() -> u64 {
    5_000
}

const fn default_max_detection_attempts() -> u32 {
    20
}

const fn default_max_concurrent_detections() -> usize {
    5
}

const fn default_memory_pressure_window_ms() -> u64 {
    5_000
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lag_poll_interval_ms: default_lag_poll_interval_ms(),
            presentation_lag_defect: false,
            max_detection_duration_ms: default_max_detection_duration_ms(),
            max_detection_attempts: default_max_detection_attempts(),
            max_concurrent_detections: default_max_concurrent_detections(),
            memory_pressure_window_ms: default_memory_pressure_window_ms(),
        }
    }
}

impl DetectionConfig {
    /// Interval between ticks for the configured platform.
    pub fn effective_poll_interval(&self) -> Duration {
        if self.presentation_lag_defect {
            Duration::from_millis(self.lag_poll_interval_ms)
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }

    pub fn max_detection_duration(&self) -> Duration {
        Duration::from_millis(self.max_detection_duration_ms)
    }

    pub fn memory_pressure_window(&self) -> Duration {
        Duration::from_millis(self.memory_pressure_window_ms)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts per operation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Lower bound of the jitter multiplier
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,

    /// Upper bound of the jitter multiplier
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,

    /// Hard timeout for one re-detection attempt
    #[serde(default = "default_per_attempt_timeout_ms")]
    pub per_attempt_timeout_ms: u64,

    /// Pick strategies from recorded success rates
    #[serde(default = "default_true")]
    pub adaptive_enabled: bool,

    /// Maximum concurrently retried calls
    #[serde(default = "default_max_concurrent_retries")]
    pub max_concurrent_retries: usize,

    /// Refuse new retries above this resident memory
    #[serde(default = "default_max_resident_memory_mb")]
    pub max_resident_memory_mb: u64,

    /// How long new retries are refused after a memory-pressure signal
    #[serde(default = "default_memory_pressure_backoff_ms")]
    pub memory_pressure_backoff_ms: u64,

    /// Age after which retry history is swept
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,

    /// Interval of the age-based history sweep
    #[serde(default = "default_history_sweep_interval_secs")]
    pub history_sweep_interval_secs: u64,
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_initial_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter_min() -> f64 {
    0.8
}

const fn default_jitter_max() -> f64 {
    1.2
}

const fn default_per_attempt_timeout_ms() -> u64 {
    10_000
}

const fn default_true() -> bool {
    true
}

const fn default_max_concurrent_retries() -> usize {
    3
}

const fn default_max_resident_memory_mb() -> u64 {
    512
}

const fn default_memory_pressure_backoff_ms() -> u64 {
    10_000
}

const fn default_history_retention_days() -> u32 {
    7
}

const fn default_history_sweep_interval_secs() -> u64 {
    3_600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            per_attempt_timeout_ms: default_per_attempt_timeout_ms(),
            adaptive_enabled: true,
            max_concurrent_retries: default_max_concurrent_retries(),
            max_resident_memory_mb: default_max_resident_memory_mb(),
            memory_pressure_backoff_ms: default_memory_pressure_backoff_ms(),
            history_retention_days: default_history_retention_days(),
            history_sweep_interval_secs: default_history_sweep_interval_secs(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a probe
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Whether the breaker is consulted at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// State synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    /// Ring buffer size for recent events
    #[serde(default = "default_recent_event_capacity")]
    pub recent_event_capacity: usize,

    /// Ring buffer size for conflict history
    #[serde(default = "default_conflict_history_capacity")]
    pub conflict_history_capacity: usize,

    /// Events closer than this may conflict
    #[serde(default = "default_conflict_window_ms")]
    pub conflict_window_ms: u64,

    /// Weight of the newest sample in the latency running average
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,

    /// Health score below which observers get a critical error
    #[serde(default = "default_critical_health_score")]
    pub critical_health_score: f64,

    /// Interval of the periodic metrics evaluation
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Per-source priority overrides
    #[serde(default)]
    pub source_priorities: HashMap<SyncSource, u32>,
}

const fn default_recent_event_capacity() -> usize {
    100
}

const fn default_conflict_history_capacity() -> usize {
    50
}

const fn default_conflict_window_ms() -> u64 {
    500
}

const fn default_latency_smoothing() -> f64 {
    0.1
}

const fn default_critical_health_score() -> f64 {
    0.5
}

const fn default_metrics_interval_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recent_event_capacity: default_recent_event_capacity(),
            conflict_history_capacity: default_conflict_history_capacity(),
            conflict_window_ms: default_conflict_window_ms(),
            latency_smoothing: default_latency_smoothing(),
            critical_health_score: default_critical_health_score(),
            metrics_interval_secs: default_metrics_interval_secs(),
            source_priorities: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Effective priority of `source`.
    pub fn priority_of(&self, source: SyncSource) -> u32 {
        self.source_priorities
            .get(&source)
            .copied()
            .unwrap_or_else(|| source.default_priority())
    }

    pub fn conflict_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.conflict_window_ms).unwrap_or(i64::MAX))
    }
}

/// Call UI state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StateMachineConfig {
    /// Snapshots kept per call
    #[serde(default = "default_snapshot_history_capacity")]
    pub snapshot_history_capacity: usize,

    /// Transitions kept in the global log
    #[serde(default = "default_transition_log_capacity")]
    pub transition_log_capacity: usize,

    /// Interval of the periodic health analysis
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// A non-terminal call unchanged for this long is stuck
    #[serde(default = "default_stuck_state_timeout_secs")]
    pub stuck_state_timeout_secs: u64,

    /// Active calls beyond this count lower the health score
    #[serde(default = "default_max_expected_active_calls")]
    pub max_expected_active_calls: usize,

    /// Error rate above which a recommendation is raised
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Validity of emitted recommendations
    #[serde(default = "default_recommendation_ttl_secs")]
    pub recommendation_ttl_secs: u64,

    /// Recent snapshots inspected for loops
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,

    /// Occurrences of one state inside the window that count as a loop
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,

    /// A call still in `backgrounding` after this long fails backgrounding
    #[serde(default = "default_backgrounding_timeout_ms")]
    pub backgrounding_timeout_ms: u64,
}

impl StateMachineConfig {
    pub fn backgrounding_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.backgrounding_timeout_ms)
    }
}

const fn default_snapshot_history_capacity() -> usize {
    50
}

const fn default_transition_log_capacity() -> usize {
    200
}

const fn default_health_check_interval_secs() -> u64 {
    60
}

const fn default_stuck_state_timeout_secs() -> u64 {
    30
}

const fn default_max_expected_active_calls() -> usize {
    3
}

const fn default_error_rate_threshold() -> f64 {
    0.2
}

const fn default_recommendation_ttl_secs() -> u64 {
    300
}

const fn default_loop_window() -> usize {
    10
}

const fn default_loop_threshold() -> usize {
    3
}

const fn default_backgrounding_timeout_ms() -> u64 {
    5_000
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            snapshot_history_capacity: default_snapshot_history_capacity(),
            transition_log_capacity: default_transition_log_capacity(),
            health_check_interval_secs: default_health_check_interval_secs(),
            stuck_state_timeout_secs: default_stuck_state_timeout_secs(),
            max_expected_active_calls: default_max_expected_active_calls(),
            error_rate_threshold: default_error_rate_threshold(),
            recommendation_ttl_secs: default_recommendation_ttl_secs(),
            loop_window: default_loop_window(),
            loop_threshold: default_loop_threshold(),
            backgrounding_timeout_ms: default_backgrounding_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation policy for file output: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_follows_platform() {
        let mut config = DetectionConfig::default();
        assert_eq!(config.effective_poll_interval(), Duration::from_millis(500));
        config.presentation_lag_defect = true;
        assert_eq!(config.effective_poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_priority_overrides() {
        let mut config = SyncConfig::default();
        assert_eq!(config.priority_of(SyncSource::CallKit), 100);
        config.source_priorities.insert(SyncSource::System, 100);
        assert_eq!(config.priority_of(SyncSource::System), 100);
        assert_eq!(config.priority_of(SyncSource::External), 20);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "retry:\n  max_retries: 2\nsync:\n  conflict_window_ms: 250\n";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.sync.conflict_window_ms, 250);
        assert_eq!(config.state_machine.transition_log_capacity, 200);
    }
}
