use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use faultline_telemetry::{
    install_capture_points, CaptureHandle, Failure, Fetch, LogFormat, LogLevel,
    ObservabilityConfig, TelemetrySystem,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n  FAULTLINE_DSN (or SENTRY_DSN)   Remote reporter DSN; unset disables remote reporting\n  FAULTLINE_LOG_LEVEL             Diagnostics level (trace, debug, info, warn, error)\n  FAULTLINE_LOG_FORMAT            Diagnostics format (json, pretty, compact)\n  FAULTLINE_MIN_ERROR_STATUS      Lowest HTTP status recorded as a failed fetch"
)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, help = "Path to observability configuration file")]
    config: Option<PathBuf>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(long, global = true, help = "Set diagnostics log level")]
    log_level: Option<String>,

    /// Set log format (json, pretty, compact)
    #[arg(long, global = true, help = "Set diagnostics output format")]
    log_format: Option<String>,

    /// Remote reporter DSN
    #[arg(long, global = true, help = "Override the remote reporter DSN")]
    dsn: Option<String>,

    /// Strip request headers and metadata from remote reports
    #[arg(long, global = true, help = "Do not send request headers or metadata to the reporter")]
    no_pii: bool,

    /// Lowest HTTP status recorded as a failed fetch
    #[arg(long, global = true, help = "Lowest response status treated as a failure")]
    min_error_status: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Config,
    /// Write a default configuration file
    ConfigInit {
        /// Destination, defaults to the per-user config directory
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Perform an observed HTTP request
    Fetch {
        url: String,
        #[arg(long, default_value = "GET")]
        method: String,
    },
    /// Trigger one capture point end to end
    Simulate {
        #[arg(value_enum)]
        kind: SimulationKind,
        #[arg(long, default_value = "simulated failure")]
        message: String,
        /// Route reported by `simulate route`
        #[arg(long, default_value = "/")]
        route: String,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Config => "config",
            Command::ConfigInit { .. } => "config-init",
            Command::Fetch { .. } => "fetch",
            Command::Simulate { .. } => "simulate",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SimulationKind {
    Panic,
    Rejection,
    Manual,
    Route,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Command::ConfigInit { path } = &cli.command {
        return init_config(path.clone()).await;
    }

    let config = create_observability_config(&cli).await?;

    if let Err(e) = TelemetrySystem::init(&config) {
        eprintln!("Failed to initialize diagnostics: {}", e);
        return Err(anyhow::anyhow!("Diagnostics initialization failed: {}", e));
    }

    let capture = install_capture_points(&config);
    info!(command = cli.command.name(), "Running command");

    let outcome = match cli.command {
        Command::Config => print_config(&config),
        Command::ConfigInit { .. } => Ok(()),
        Command::Fetch { url, method } => run_fetch(&capture, &url, &method).await,
        Command::Simulate {
            kind,
            message,
            route,
        } => simulate(&capture, kind, &message, &route).await,
    };

    let timeout = Duration::from_secs(config.reporter.timeout_secs);
    if !capture.flush(timeout).await {
        warn!(
            pending = capture.pipeline().reporter().in_flight(),
            "Some error reports were still in flight at shutdown"
        );
    }

    outcome
}

/// Load configuration and apply command line overrides on top of file and environment
async fn create_observability_config(cli: &Cli) -> Result<ObservabilityConfig> {
    let mut config = ObservabilityConfig::load(cli.config.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    apply_cli_overrides(&mut config, cli);

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

fn apply_cli_overrides(config: &mut ObservabilityConfig, cli: &Cli) {
    if let Some(level) = cli.log_level.as_deref() {
        match LogLevel::parse(level) {
            Some(level) => config.logging.level = level,
            None => eprintln!("Warning: Invalid log level '{}', keeping configured level", level),
        }
    }

    if let Some(format) = cli.log_format.as_deref() {
        match LogFormat::parse(format) {
            Some(format) => config.logging.console_format = format,
            None => eprintln!("Warning: Invalid log format '{}', keeping configured format", format),
        }
    }

    if let Some(dsn) = cli.dsn.as_deref() {
        let dsn = dsn.trim();
        config.reporter.dsn = (!dsn.is_empty()).then(|| dsn.to_string());
    }

    if cli.no_pii {
        config.reporter.send_default_pii = false;
    }

    if let Some(status) = cli.min_error_status {
        config.capture.min_error_status = status;
    }
}

async fn init_config(path: Option<PathBuf>) -> Result<()> {
    let config = ObservabilityConfig::default();
    config
        .save(path.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write configuration: {}", e))?;

    let written = match path {
        Some(path) => path,
        None => ObservabilityConfig::default_config_path()?,
    };
    println!("Wrote default configuration to {}", written.display());
    Ok(())
}

fn print_config(config: &ObservabilityConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config)?;
    println!("{}", rendered);
    Ok(())
}

async fn run_fetch(capture: &CaptureHandle, url: &str, method: &str) -> Result<()> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid HTTP method '{}': {}", method, e))?;

    let client = capture.observe_fetch(reqwest::Client::new());
    let request = client.inner().request(method, url).build()?;

    match client.fetch(request).await {
        Ok(response) => {
            let status = response.status();
            println!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );
            Ok(())
        }
        Err(e) => {
            error!(url = %url, error = %e, "Request failed");
            Err(anyhow::anyhow!("Request to {} failed: {}", url, e))
        }
    }
}

async fn simulate(
    capture: &CaptureHandle,
    kind: SimulationKind,
    message: &str,
    route: &str,
) -> Result<()> {
    match kind {
        SimulationKind::Manual => {
            capture.log_server_error(Failure::known("Error", message), "manual", None);
        }
        SimulationKind::Route => {
            capture.log_route_error(Failure::known("RouteError", message), route);
        }
        SimulationKind::Rejection => {
            let reason = message.to_string();
            let task = capture.spawn_observed(async move { Err::<(), _>(reason) });
            task.await?;
        }
        SimulationKind::Panic => {
            let failure = Failure::known("Panic", message);
            let task = tokio::spawn(async move { std::panic::panic_any(failure) });
            if let Err(join_error) = task.await {
                if join_error.is_panic() {
                    // Let the reporter finish, then continue the fatal path
                    let timeout = Duration::from_secs(capture.config().reporter.timeout_secs);
                    capture.flush(timeout).await;
                    std::panic::resume_unwind(join_error.into_panic());
                }
            }
        }
    }
    Ok(())
}
