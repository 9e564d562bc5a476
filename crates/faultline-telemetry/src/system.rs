//! Diagnostics subscriber for the pipeline's own logging

use crate::{
    config::{LogFormat, ObservabilityConfig},
    Error, Result,
};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Sets up the global `tracing` subscriber used for diagnostics.
///
/// `[SERVER ERROR]` entries do not go through this subscriber; it only
/// carries events such as reporter failures and installation notices.
pub struct TelemetrySystem;

impl TelemetrySystem {
    /// Initialize the global subscriber with the given configuration
    pub fn init(config: &ObservabilityConfig) -> Result<()> {
        let subscriber = Registry::default()
            .with(Self::build_console_layer(config))
            .with(Self::build_env_filter(config)?);

        subscriber.try_init().map_err(|e| Error::System {
            message: format!("Failed to initialize tracing subscriber: {}", e),
        })?;

        tracing::info!(
            telemetry.event = "system_initialized",
            telemetry.version = env!("CARGO_PKG_VERSION"),
            "Telemetry system initialized successfully"
        );

        Ok(())
    }

    /// Build environment filter for log level filtering
    fn build_env_filter(config: &ObservabilityConfig) -> Result<EnvFilter> {
        // Allow environment override
        if let Ok(env_filter) = std::env::var("RUST_LOG") {
            return EnvFilter::try_new(env_filter).map_err(|e| Error::Config {
                message: format!("Invalid RUST_LOG filter: {}", e),
            });
        }

        let level: Level = config.logging.level.into();
        let mut filter = EnvFilter::new(level.to_string());

        for directive in ["hyper=warn", "reqwest=warn", "h2=warn"] {
            let directive = directive.parse().map_err(|e| Error::Config {
                message: format!("Invalid filter directive '{}': {}", directive, e),
            })?;
            filter = filter.add_directive(directive);
        }

        Ok(filter)
    }

    /// Build console logging layer
    fn build_console_layer(
        config: &ObservabilityConfig,
    ) -> Option<Box<dyn Layer<Registry> + Send + Sync>> {
        if !config.enabled || !config.logging.console_enabled {
            return None;
        }

        let layer = match config.logging.console_format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        };

        Some(layer)
    }
}
