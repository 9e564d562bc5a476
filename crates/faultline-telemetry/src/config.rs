//! Observability configuration and management

use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

/// Main observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Global enable/disable toggle
    pub enabled: bool,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Remote error-tracking service settings
    pub reporter: ReporterConfig,

    /// Which capture points get installed
    pub capture: CaptureConfig,

    /// Privacy and security settings
    pub privacy: PrivacyConfig,
}

/// Logging-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level for the pipeline's own diagnostics (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: LogLevel,

    /// Serialization of the `[SERVER ERROR]` entry
    pub format: LogFormat,

    /// Output format of the diagnostics console layer
    pub console_format: LogFormat,

    /// Enable the diagnostics console layer
    pub console_enabled: bool,
}

/// Error-tracking service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// DSN of the error-tracking project; reporting is disabled when absent
    pub dsn: Option<String>,

    /// Attach request headers and client addresses to reports
    pub send_default_pii: bool,

    /// Deployment environment tag (production, staging, ...)
    pub environment: Option<String>,

    /// Release identifier attached to reports
    pub release: Option<String>,

    /// Upper bound for a single report delivery (in seconds)
    pub timeout_secs: u64,
}

/// Capture point switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Install the panic hook
    pub panics: bool,

    /// Observe failures of tasks spawned through the capture handle
    pub rejections: bool,

    /// Observe outbound calls made through `ObservedFetch`
    pub fetch: bool,

    /// Lowest response status treated as a failed outbound call
    pub min_error_status: u16,
}

/// Privacy and security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Header names whose values are always redacted (case-insensitive)
    pub redacted_headers: Vec<String>,

    /// Patterns redacted from URLs, messages and stacks. The first capture
    /// group, when present, is kept in front of the redaction marker.
    pub redaction_patterns: Vec<String>,
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl LogLevel {
    /// Parse a case-insensitive level name
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Structured single-line JSON
    Json,
    /// Human-readable, indented
    Pretty,
    /// Compact single-line text (diagnostics only)
    Compact,
}

impl LogFormat {
    /// Parse a case-insensitive format name
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            logging: LoggingConfig {
                level: LogLevel::Info,
                format: LogFormat::Json,
                console_format: LogFormat::Compact,
                console_enabled: true,
            },
            reporter: ReporterConfig {
                dsn: None,
                send_default_pii: true,
                environment: None,
                release: None,
                timeout_secs: 5,
            },
            capture: CaptureConfig {
                panics: true,
                rejections: true,
                fetch: true,
                min_error_status: 400,
            },
            privacy: PrivacyConfig {
                redacted_headers: vec![
                    "authorization".to_string(),
                    "proxy-authorization".to_string(),
                    "cookie".to_string(),
                    "set-cookie".to_string(),
                    "x-api-key".to_string(),
                ],
                redaction_patterns: vec![
                    // Credentials passed as query parameters
                    r"(?i)([?&](?:access_token|token|api_?key|key|secret|password|signature|sig)=)[^&#\s]*"
                        .to_string(),
                    // Bearer tokens echoed into messages
                    r"(?i)(bearer\s+)[a-z0-9_\-\.=]+".to_string(),
                ],
            },
        }
    }
}

impl ObservabilityConfig {
    /// Load configuration from file or create default
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = if config_file.exists() {
            let content = tokio::fs::read_to_string(&config_file).await?;
            toml::from_str(&content).map_err(|e| Error::Config {
                message: format!("Failed to parse observability config: {}", e),
            })?
        } else {
            Self::default()
        };

        config.load_env_overrides();
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        // Ensure parent directory exists
        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("Failed to serialize observability config: {}", e),
        })?;

        tokio::fs::write(&config_file, content).await?;
        Ok(())
    }

    /// Load environment variable overrides
    pub fn load_env_overrides(&mut self) {
        // Global toggle
        if let Ok(enabled) = std::env::var("FAULTLINE_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
        }

        // Reporter
        if let Some(dsn) = std::env::var("FAULTLINE_DSN")
            .ok()
            .or_else(|| std::env::var("SENTRY_DSN").ok())
        {
            let dsn = dsn.trim();
            self.reporter.dsn = if dsn.is_empty() {
                None
            } else {
                Some(dsn.to_string())
            };
        }

        if let Ok(pii) = std::env::var("FAULTLINE_SEND_DEFAULT_PII") {
            self.reporter.send_default_pii = pii.parse().unwrap_or(self.reporter.send_default_pii);
        }

        if let Ok(environment) = std::env::var("FAULTLINE_ENVIRONMENT") {
            self.reporter.environment = Some(environment);
        }

        if let Ok(release) = std::env::var("FAULTLINE_RELEASE") {
            self.reporter.release = Some(release);
        }

        // Log level
        if let Ok(level) = std::env::var("FAULTLINE_LOG_LEVEL") {
            self.logging.level = LogLevel::parse(&level).unwrap_or(self.logging.level);
        }

        // Diagnostics format, same field as the `--log-format` flag
        if let Ok(format) = std::env::var("FAULTLINE_LOG_FORMAT") {
            self.logging.console_format =
                LogFormat::parse(&format).unwrap_or(self.logging.console_format);
        }

        // Outbound call threshold
        if let Ok(status) = std::env::var("FAULTLINE_MIN_ERROR_STATUS") {
            self.capture.min_error_status = status.parse().unwrap_or(self.capture.min_error_status);
        }
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("dev", "faultline", "faultline").ok_or_else(|| Error::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("observability.toml"))
    }

    /// Validate configuration.
    ///
    /// A malformed DSN is not an error here: it only disables remote reporting.
    pub fn validate(&self) -> Result<()> {
        if !(100..=599).contains(&self.capture.min_error_status) {
            return Err(Error::Config {
                message: format!(
                    "min_error_status must be a valid HTTP status, got {}",
                    self.capture.min_error_status
                ),
            });
        }

        if self.reporter.timeout_secs == 0 {
            return Err(Error::Config {
                message: "timeout_secs must be greater than 0".to_string(),
            });
        }

        if self.logging.format == LogFormat::Compact {
            return Err(Error::Config {
                message: "logging.format must be Json or Pretty".to_string(),
            });
        }

        for pattern in &self.privacy.redaction_patterns {
            regex::Regex::new(pattern).map_err(|e| Error::Config {
                message: format!("Invalid redaction pattern '{}': {}", pattern, e),
            })?;
        }

        Ok(())
    }
}
