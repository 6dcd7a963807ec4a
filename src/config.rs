//! Configuration schema, builder, and file loading.
//!
//! All tunables live in one flat [`Config`] with serde defaults, so a host
//! can construct it programmatically with the `with_*` builder methods or
//! deserialize it from a TOML file.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Informational run mode, surfaced on the dashboard system page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Dev,
    Prod,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Dev => write!(f, "dev"),
            Mode::Prod => write!(f, "prod"),
        }
    }
}

/// Observability layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the dashboard (e.g. "127.0.0.1:9090").
    pub listen_addr: String,

    /// Ring-buffer capacity for recent traces.
    pub buffer_size: usize,

    /// Run mode (informational).
    pub mode: Mode,

    /// Probability a request is traced; 1.0 traces everything.
    pub sampling_rate: f64,

    /// Buffer request and response bodies into the trace.
    pub capture_body: bool,

    /// Snapshot request and response headers into the trace.
    pub capture_headers: bool,

    /// Dashboard basic-auth user; empty (with empty pass) leaves the
    /// dashboard open.
    pub basic_auth_user: String,

    /// Dashboard basic-auth password.
    pub basic_auth_pass: String,

    /// Single-query duration over which `slow_query` fires.
    pub slow_query_threshold_ms: u64,

    /// Route p95 over which `slow_route` fires (routes with >= 10 requests).
    pub slow_route_p95_threshold_ms: u64,

    /// Error-rate percentage over which `high_error_rate` fires (routes
    /// with >= 10 requests).
    pub high_error_rate_percent: f64,

    /// Repeats of one query pattern within a trace over which `n_plus_one`
    /// fires.
    pub n_plus_one_threshold: usize,

    /// Allocation delta over which `memory_spike` fires.
    pub memory_spike_bytes: u64,

    /// Latency-sample reservoir capacity per route.
    pub latency_cap: usize,

    /// Maximum retained alerts; oldest are dropped past this.
    pub alert_log_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
            buffer_size: 1000,
            mode: Mode::Dev,
            sampling_rate: 1.0,
            capture_body: true,
            capture_headers: true,
            basic_auth_user: String::new(),
            basic_auth_pass: String::new(),
            slow_query_threshold_ms: 500,
            slow_route_p95_threshold_ms: 2_000,
            high_error_rate_percent: 10.0,
            n_plus_one_threshold: 5,
            memory_spike_bytes: 10 * 1024 * 1024,
            latency_cap: 10_000,
            alert_log_cap: 1000,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "listen_addr",
                format!("{:?} is not a valid socket address", self.listen_addr),
            ));
        }
        if self.buffer_size == 0 {
            errors.push(ValidationError::new("buffer_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            errors.push(ValidationError::new(
                "sampling_rate",
                "must be within [0.0, 1.0]",
            ));
        }
        if self.latency_cap == 0 {
            errors.push(ValidationError::new("latency_cap", "must be at least 1"));
        }
        if self.alert_log_cap == 0 {
            errors.push(ValidationError::new("alert_log_cap", "must be at least 1"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    pub fn slow_route_p95_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_route_p95_threshold_ms)
    }

    /// Whether the dashboard requires credentials.
    pub fn auth_enabled(&self) -> bool {
        !self.basic_auth_user.is_empty() && !self.basic_auth_pass.is_empty()
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn with_capture_body(mut self, capture: bool) -> Self {
        self.capture_body = capture;
        self
    }

    pub fn with_capture_headers(mut self, capture: bool) -> Self {
        self.capture_headers = capture;
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.basic_auth_user = user.into();
        self.basic_auth_pass = pass.into();
        self
    }

    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_slow_route_threshold(mut self, threshold: Duration) -> Self {
        self.slow_route_p95_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn with_high_error_rate(mut self, percent: f64) -> Self {
        self.high_error_rate_percent = percent;
        self
    }

    pub fn with_n_plus_one_threshold(mut self, threshold: usize) -> Self {
        self.n_plus_one_threshold = threshold;
        self
    }

    pub fn with_memory_spike_bytes(mut self, bytes: u64) -> Self {
        self.memory_spike_bytes = bytes;
        self
    }

    pub fn with_latency_cap(mut self, cap: usize) -> Self {
        self.latency_cap = cap;
        self
    }

    pub fn with_alert_log_cap(mut self, cap: usize) -> Self {
        self.alert_log_cap = cap;
        self
    }
}

/// A single failed configuration check.
#[derive(Debug)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.latency_cap, 10_000);
        assert!((config.sampling_rate - 1.0).abs() < f64::EPSILON);
        assert!(!config.auth_enabled());
    }

    #[test]
    fn builder_round_trip() {
        let config = Config::default()
            .with_buffer_size(50)
            .with_sampling_rate(0.25)
            .with_basic_auth("ops", "secret")
            .with_slow_query_threshold(Duration::from_millis(100));

        assert_eq!(config.buffer_size, 50);
        assert!((config.sampling_rate - 0.25).abs() < f64::EPSILON);
        assert!(config.auth_enabled());
        assert_eq!(config.slow_query_threshold(), Duration::from_millis(100));
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let config = Config::default()
            .with_listen_addr("not-an-address")
            .with_buffer_size(0)
            .with_sampling_rate(1.5);

        let errors = config.validate().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert!(fields.contains(&"listen_addr"));
        assert!(fields.contains(&"buffer_size"));
        assert!(fields.contains(&"sampling_rate"));
    }

    #[test]
    fn toml_defaults_fill_missing_fields() {
        let config: Config = toml::from_str("buffer_size = 10").unwrap();
        assert_eq!(config.buffer_size, 10);
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.mode, Mode::Dev);
    }
}
