//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Pipeline
//!
//! - `PIPELINE`: Comma-separated middleware stages, outermost first
//!   (default: `recovery,access_log,metrics,cors,rate_limit`).
//!   Known stages: `recovery`, `access_log`, `metrics`, `cors`, `rate_limit`, `cidr`, `jwt`
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_RPS`: Tokens refilled per second, fractional allowed (default: 5)
//! - `RATE_LIMIT_BURST`: Bucket capacity (default: 10)
//! - `RATE_LIMIT_CLEAN_INTERVAL_SECS`: Janitor period (default: 60)
//! - `RATE_LIMIT_INACTIVITY_SECS`: Idle time before a client is evicted (default: 300)
//!
//! # Access Control
//!
//! - `ALLOWED_CIDRS`: Networks admitted by the `cidr` stage besides loopback (default: none)
//! - `CORS_ALLOWED_ORIGINS`: Allowed origins, `*` for any (default: `*`)
//! - `JWT_SECRET`: HMAC secret, required when the `jwt` stage is enabled
//!
//! # Observability
//!
//! - `METRICS_PORT`: Prometheus listener port, 0 disables (default: 9090)
//! - `LOG_FORMAT`: `text` or `json` (default: `text`)

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::{CidrRange, RateLimitConfig};

/// Middleware stage names accepted in `PIPELINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Recovery,
    AccessLog,
    Metrics,
    Cors,
    RateLimit,
    Cidr,
    Jwt,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 7] = [
        Self::Recovery,
        Self::AccessLog,
        Self::Metrics,
        Self::Cors,
        Self::RateLimit,
        Self::Cidr,
        Self::Jwt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::AccessLog => "access_log",
            Self::Metrics => "metrics",
            Self::Cors => "cors",
            Self::RateLimit => "rate_limit",
            Self::Cidr => "cidr",
            Self::Jwt => "jwt",
        }
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "unknown pipeline stage '{s}' (expected one of: {})",
                    Self::ALL.map(|stage| stage.as_str()).join(", ")
                )
            })
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// JWT HMAC secret, redacted in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct JwtSecret(Vec<u8>);

impl JwtSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JwtSecret([REDACTED])")
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Middleware stages, outermost first
    pub pipeline: Vec<PipelineStage>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Tokens regained per second per client (default: 5)
    pub rate_limit_rps: f64,

    /// Bucket capacity per client (default: 10)
    pub rate_limit_burst: u32,

    /// How often idle clients are evicted (default: 60s)
    pub rate_limit_clean_interval: Duration,

    /// Idle time after which a client is forgotten (default: 300s)
    pub rate_limit_inactivity: Duration,

    // =========================================================================
    // Access Control Configuration
    // =========================================================================
    /// Networks admitted by the `cidr` stage in addition to loopback.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,100.64.0.0/10")
    pub allowed_cidrs: Vec<String>,

    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// HMAC secret for the `jwt` stage
    pub jwt_secret: Option<JwtSecret>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,

    /// Log output format (default: text)
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` (or a more specific variant) if any
    /// value fails to parse or validate.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            // Server
            host: lookup("HOST").unwrap_or(defaults.host),
            port: Self::parse_var(&lookup, "PORT", defaults.port)?,
            pipeline: match lookup("PIPELINE") {
                Some(raw) => Self::parse_pipeline(&raw)?,
                None => defaults.pipeline,
            },

            // Rate limiting
            rate_limit_rps: Self::parse_var(&lookup, "RATE_LIMIT_RPS", defaults.rate_limit_rps)?,
            rate_limit_burst: Self::parse_var(
                &lookup,
                "RATE_LIMIT_BURST",
                defaults.rate_limit_burst,
            )?,
            rate_limit_clean_interval: Duration::from_secs(Self::parse_var(
                &lookup,
                "RATE_LIMIT_CLEAN_INTERVAL_SECS",
                defaults.rate_limit_clean_interval.as_secs(),
            )?),
            rate_limit_inactivity: Duration::from_secs(Self::parse_var(
                &lookup,
                "RATE_LIMIT_INACTIVITY_SECS",
                defaults.rate_limit_inactivity.as_secs(),
            )?),

            // Access control
            allowed_cidrs: lookup("ALLOWED_CIDRS")
                .map(|raw| Self::parse_list(&raw))
                .unwrap_or(defaults.allowed_cidrs),
            cors_allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .map(|raw| Self::parse_list(&raw))
                .unwrap_or(defaults.cors_allowed_origins),
            jwt_secret: lookup("JWT_SECRET")
                .filter(|s| !s.is_empty())
                .map(JwtSecret::new),

            // Observability
            metrics_port: Self::parse_var(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            log_format: Self::parse_var(&lookup, "LOG_FORMAT", defaults.log_format)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        self.rate_limit_config().validate()?;

        for cidr in &self.allowed_cidrs {
            cidr.parse::<CidrRange>()?;
        }

        if self.stage_enabled(PipelineStage::Jwt) && self.jwt_secret.is_none() {
            return Err(AppError::ConfigError(
                "JWT_SECRET must be set when the jwt stage is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if a middleware stage is part of the pipeline.
    pub fn stage_enabled(&self, stage: PipelineStage) -> bool {
        self.pipeline.contains(&stage)
    }

    /// Rate limiter parameters.
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.rate_limit_rps, self.rate_limit_burst)
            .with_janitor(self.rate_limit_clean_interval, self.rate_limit_inactivity)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        if self.metrics_enabled() {
            Some(SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
        } else {
            None
        }
    }

    /// Parse a `PIPELINE` value, rejecting unknown and repeated stages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` naming the offending stage.
    pub fn parse_pipeline(raw: &str) -> AppResult<Vec<PipelineStage>> {
        let mut seen = HashSet::new();
        Self::parse_list(raw)
            .iter()
            .map(|name| {
                let stage: PipelineStage = name
                    .parse()
                    .map_err(|e| AppError::ConfigError(format!("Invalid PIPELINE: {e}")))?;
                if !seen.insert(stage) {
                    return Err(AppError::ConfigError(format!(
                        "Invalid PIPELINE: stage '{stage}' listed more than once"
                    )));
                }
                Ok(stage)
            })
            .collect()
    }

    /// Parse a variable into the specified type with a default value.
    fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> AppResult<T>
    where
        F: Fn(&str) -> Option<String>,
        T: FromStr,
        T::Err: fmt::Display,
    {
        match lookup(name) {
            Some(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            None => Ok(default),
        }
    }

    /// Split a comma-separated list, dropping blank entries.
    fn parse_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            pipeline: vec![
                PipelineStage::Recovery,
                PipelineStage::AccessLog,
                PipelineStage::Metrics,
                PipelineStage::Cors,
                PipelineStage::RateLimit,
            ],
            // Rate limiting
            rate_limit_rps: 5.0,
            rate_limit_burst: 10,
            rate_limit_clean_interval: Duration::from_secs(60),
            rate_limit_inactivity: Duration::from_secs(300),
            // Access control
            allowed_cidrs: vec![],
            cors_allowed_origins: vec!["*".to_string()],
            jwt_secret: None,
            // Observability
            metrics_port: 9090,
            log_format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> AppResult<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.rate_limit_rps, 5.0);
        assert_eq!(config.rate_limit_burst, 10);
        assert_eq!(config.rate_limit_clean_interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit_inactivity, Duration::from_secs(300));
        assert!(config.stage_enabled(PipelineStage::RateLimit));
        assert!(!config.stage_enabled(PipelineStage::Jwt));
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.pipeline, Config::default().pipeline);
        assert_eq!(config.cors_allowed_origins, vec!["*"]);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "localhost".to_string(),
            port: 3000,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "localhost:3000");
    }

    #[test]
    fn test_reads_variables() {
        let config = from_vars(&[
            ("PORT", "8080"),
            ("PIPELINE", "recovery, cidr ,jwt"),
            ("RATE_LIMIT_RPS", "0.5"),
            ("RATE_LIMIT_BURST", "3"),
            ("ALLOWED_CIDRS", "10.0.0.0/8, 100.64.0.0/10"),
            ("JWT_SECRET", "s3cr3t"),
            ("METRICS_PORT", "0"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(
            config.pipeline,
            vec![PipelineStage::Recovery, PipelineStage::Cidr, PipelineStage::Jwt]
        );
        assert_eq!(config.rate_limit_rps, 0.5);
        assert_eq!(config.allowed_cidrs.len(), 2);
        assert_eq!(config.jwt_secret.as_ref().unwrap().as_bytes(), b"s3cr3t");
        assert!(config.metrics_addr().is_none());
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = from_vars(&[("PORT", "not-a-port")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_non_positive_rate_limit_is_rejected() {
        assert!(matches!(
            from_vars(&[("RATE_LIMIT_RPS", "0")]),
            Err(AppError::RateLimit(_))
        ));
        assert!(matches!(
            from_vars(&[("RATE_LIMIT_BURST", "0")]),
            Err(AppError::RateLimit(_))
        ));
        assert!(matches!(
            from_vars(&[("RATE_LIMIT_INACTIVITY_SECS", "0")]),
            Err(AppError::RateLimit(_))
        ));
    }

    #[test]
    fn test_tiny_positive_rate_is_accepted() {
        let config = from_vars(&[("RATE_LIMIT_RPS", "1e-20")]).unwrap();
        assert_eq!(config.rate_limit_rps, 1e-20);
    }

    #[test]
    fn test_invalid_cidr_is_rejected() {
        assert!(matches!(
            from_vars(&[("ALLOWED_CIDRS", "10.0.0.0/8,garbage")]),
            Err(AppError::Cidr(_))
        ));
    }

    #[test]
    fn test_jwt_stage_requires_secret() {
        let err = from_vars(&[("PIPELINE", "jwt")]).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn test_parse_pipeline() {
        assert_eq!(Config::parse_pipeline("").unwrap(), vec![]);
        assert_eq!(
            Config::parse_pipeline("Rate_Limit,cors").unwrap(),
            vec![PipelineStage::RateLimit, PipelineStage::Cors]
        );

        let unknown = Config::parse_pipeline("recovery,timeout").unwrap_err();
        assert!(unknown.to_string().contains("timeout"));

        let duplicate = Config::parse_pipeline("cors,recovery,cors").unwrap_err();
        assert!(duplicate.to_string().contains("more than once"));
    }

    #[test]
    fn test_stage_names_round_trip() {
        for stage in PipelineStage::ALL {
            assert_eq!(stage.to_string().parse::<PipelineStage>().unwrap(), stage);
        }
    }

    #[test]
    fn test_jwt_secret_is_redacted() {
        let config = Config {
            jwt_secret: Some(JwtSecret::new("hunter2")),
            ..Config::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }
}
