//! # Faultline Telemetry
//!
//! Server-side error observability for long-running services.
//!
//! ## Features
//!
//! - **Capture points**: panics, unobserved task failures and outbound HTTP
//!   calls that fail or come back with an error status
//! - **Normalization**: every failure becomes one [`ErrorRecord`]
//! - **Dual-sink delivery**: a `[SERVER ERROR]` log entry on standard error
//!   for the platform's log aggregator, plus a fire-and-forget report to a
//!   Sentry-compatible service
//! - **Privacy**: sensitive headers and query parameters are redacted before
//!   anything leaves the process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use faultline_telemetry::{install_capture_points, ObservabilityConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = ObservabilityConfig::default();
//!     config.load_env_overrides();
//!
//!     let capture = install_capture_points(&config);
//!     capture.log_server_error("something went sideways", "startup", None);
//!
//!     capture.flush(std::time::Duration::from_secs(2)).await;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod failure;
pub mod fetch;
pub mod logger;
pub mod normalize;
pub mod record;
pub mod reporter;
pub mod sanitization;
pub mod system;

#[cfg(test)]
mod tests;

pub use capture::{
    install_capture_points, log_route_error, log_server_error, CaptureBuilder, CaptureHandle,
    Pipeline,
};
pub use config::{LogFormat, LogLevel, ObservabilityConfig};
pub use failure::Failure;
pub use fetch::{Fetch, ObservedFetch};
pub use logger::DualSinkLogger;
pub use normalize::normalize;
pub use record::{CaptureContext, ErrorRecord, RequestInfo, RequestRecord};
pub use reporter::{Dsn, ErrorReporter, RemoteReporter, SentryReporter};
pub use system::TelemetrySystem;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid DSN '{dsn}': {message}")]
    Dsn { dsn: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Report rejected with status {status}: {message}")]
    Delivery { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telemetry system error: {message}")]
    System { message: String },
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// In-memory log sink shared between the logger under test and the assertions
    #[derive(Clone, Default)]
    pub struct SharedBuffer {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl SharedBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.buf.lock().unwrap()).to_string()
        }

        /// Structured entries written so far, parsed back into JSON
        pub fn entries(&self) -> Vec<serde_json::Value> {
            self.contents()
                .lines()
                .filter_map(|line| line.strip_prefix("[SERVER ERROR] "))
                .filter_map(|json| serde_json::from_str(json).ok())
                .collect()
        }
    }

    impl io::Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for SharedBuffer {
        type Writer = SharedBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }
}
