//! Capture points and the normalize-then-fan-out pipeline behind them

use crate::config::{LogFormat, ObservabilityConfig};
use crate::failure::Failure;
use crate::fetch::{Fetch, ObservedFetch};
use crate::logger::DualSinkLogger;
use crate::normalize::normalize;
use crate::record::{CaptureContext, ErrorRecord, RequestInfo};
use crate::reporter::{self, ErrorReporter, RemoteReporter};
use crate::sanitization::RecordSanitizer;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Pipeline used by the free functions, set by the last enabled install
static ACTIVE: RwLock<Option<Arc<Pipeline>>> = RwLock::new(None);

/// Ids of the installed panic hooks, most recent last
static HOOKS: Mutex<Vec<u64>> = Mutex::new(Vec::new());
static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Set on the helper thread that runs the pipeline for a panic
    static HOOK_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Normalizer, sanitizer and both sinks.
///
/// Every capture point ends up in [`Pipeline::dispatch`]. Neither sink can
/// stop the other from running and nothing here ever reaches the caller.
/// From the panic hook the pipeline runs on a helper thread, because a panic
/// raised inside a hook aborts the process.
#[derive(Debug)]
pub struct Pipeline {
    sanitizer: RecordSanitizer,
    logger: DualSinkLogger,
    reporter: RemoteReporter,
}

impl Pipeline {
    pub fn new(sanitizer: RecordSanitizer, logger: DualSinkLogger, reporter: RemoteReporter) -> Self {
        Self {
            sanitizer,
            logger,
            reporter,
        }
    }

    /// Normalize `failure` and send it to both sinks
    pub fn dispatch(&self, failure: &Failure, context: &str, request: Option<&RequestInfo>) {
        let record = normalize(failure, context, request);
        let record = self.sanitizer.sanitize(&record);
        self.fan_out(&record, true);
    }

    /// Like `dispatch` but local only, for failures raised while reporting
    fn dispatch_local(&self, failure: &Failure, context: &str) {
        let record = self.sanitizer.sanitize(&normalize(failure, context, None));
        self.fan_out(&record, false);
    }

    fn fan_out(&self, record: &ErrorRecord, remote: bool) {
        if remote {
            let reported = panic::catch_unwind(AssertUnwindSafe(|| self.reporter.report(record)));
            if reported.is_err() {
                tracing::warn!(
                    telemetry.event = "report_dispatch_panicked",
                    "Error report could not be dispatched"
                );
            }
        }

        let _ = panic::catch_unwind(AssertUnwindSafe(|| self.logger.log(record)));
    }

    pub fn reporter(&self) -> &RemoteReporter {
        &self.reporter
    }
}

/// Configures and installs the capture points
pub struct CaptureBuilder {
    config: ObservabilityConfig,
    logger: Option<DualSinkLogger>,
    backend: Option<Arc<dyn ErrorReporter>>,
}

impl CaptureBuilder {
    pub fn new(config: ObservabilityConfig) -> Self {
        Self {
            config,
            logger: None,
            backend: None,
        }
    }

    /// Send `[SERVER ERROR]` entries to `writer` instead of standard error
    pub fn with_writer<W>(mut self, writer: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        self.logger = Some(DualSinkLogger::new(self.config.logging.format, writer));
        self
    }

    /// Report through `backend` instead of the DSN-configured service
    pub fn with_reporter(mut self, backend: Arc<dyn ErrorReporter>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the pipeline and arm the enabled capture points.
    ///
    /// Never fails: an unusable reporter or invalid redaction pattern
    /// degrades the pipeline instead of aborting startup.
    pub fn install(self) -> CaptureHandle {
        let config = self.config;

        let sanitizer = RecordSanitizer::new(&config.privacy).unwrap_or_else(|e| {
            tracing::warn!(
                telemetry.event = "sanitizer_disabled",
                error = %e,
                "Invalid privacy settings, records will not be redacted"
            );
            RecordSanitizer::passthrough()
        });

        let logger = self.logger.unwrap_or_else(|| {
            let format = match config.logging.format {
                LogFormat::Pretty => LogFormat::Pretty,
                LogFormat::Json | LogFormat::Compact => LogFormat::Json,
            };
            DualSinkLogger::stderr(format)
        });

        let reporter = match self.backend {
            Some(backend) => RemoteReporter::with_backend(
                backend,
                Duration::from_secs(config.reporter.timeout_secs.max(1)),
            ),
            None => RemoteReporter::from_config(&config.reporter),
        };

        let pipeline = Arc::new(Pipeline::new(sanitizer, logger, reporter));

        if !config.enabled {
            tracing::info!(
                telemetry.event = "capture_disabled",
                "Observability disabled, no capture points installed"
            );
            return CaptureHandle {
                pipeline,
                config,
                hook: None,
                registered: false,
            };
        }

        let hook = config
            .capture
            .panics
            .then(|| install_panic_hook(Arc::clone(&pipeline)));

        if let Ok(mut active) = ACTIVE.write() {
            *active = Some(Arc::clone(&pipeline));
        }

        tracing::info!(
            telemetry.event = "capture_installed",
            capture.panics = config.capture.panics,
            capture.rejections = config.capture.rejections,
            capture.fetch = config.capture.fetch,
            reporter.enabled = pipeline.reporter().is_enabled(),
            "Capture points installed"
        );

        CaptureHandle {
            pipeline,
            config,
            hook,
            registered: true,
        }
    }
}

/// Install the capture points described by `config`, logging to standard error
pub fn install_capture_points(config: &ObservabilityConfig) -> CaptureHandle {
    CaptureBuilder::new(config.clone()).install()
}

/// Handle to an installation.
///
/// Dropping it (or calling [`CaptureHandle::uninstall`]) restores the panic
/// hook that was active before. Handles should be released in reverse order
/// of installation.
pub struct CaptureHandle {
    pipeline: Arc<Pipeline>,
    config: ObservabilityConfig,
    hook: Option<InstalledHook>,
    registered: bool,
}

/// Panic hook set by one installation and the hook it replaced
struct InstalledHook {
    id: u64,
    previous: Arc<PanicHook>,
}

impl CaptureHandle {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Configuration the handle was installed with
    pub fn config(&self) -> &ObservabilityConfig {
        &self.config
    }

    /// Manual entry point for failures outside the automatic capture points
    pub fn log_server_error(
        &self,
        error: impl Into<Failure>,
        context: &str,
        request: Option<&RequestInfo>,
    ) {
        self.pipeline.dispatch(&error.into(), context, request);
    }

    /// Record a render-time failure for `route` before a fallback is shown
    pub fn log_route_error(&self, error: impl Into<Failure>, route: &str) {
        self.log_server_error(error, route, None);
    }

    /// Record a failure nobody was waiting for
    pub fn report_rejection(&self, reason: impl Into<Failure>) {
        if self.config.enabled && self.config.capture.rejections {
            report_rejection_to(&self.pipeline, reason.into());
        }
    }

    /// Spawn `future` as a detached task and record its error, if any.
    ///
    /// The returned handle yields `Some(value)` on success and `None` when
    /// the error was captured; it may be dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, like `tokio::spawn`.
    pub fn spawn_observed<F, T, E>(&self, future: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<Failure> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        let observe = self.config.enabled && self.config.capture.rejections;

        tokio::spawn(async move {
            match future.await {
                Ok(value) => Some(value),
                Err(reason) => {
                    if observe {
                        report_rejection_to(&pipeline, reason.into());
                    }
                    None
                }
            }
        })
    }

    /// Wrap an outbound-call implementation so its failures are captured
    pub fn observe_fetch<F: Fetch>(&self, inner: F) -> ObservedFetch<F> {
        let pipeline = (self.config.enabled && self.config.capture.fetch)
            .then(|| Arc::clone(&self.pipeline));
        ObservedFetch::new(inner, pipeline, self.config.capture.min_error_status)
    }

    /// Wait up to `timeout` for pending remote reports
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.pipeline.reporter().flush(timeout).await
    }

    /// Disarm the capture points now instead of on drop
    pub fn uninstall(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(hook) = self.hook.take() {
            if !unregister_hook(hook.id) {
                tracing::warn!(
                    telemetry.event = "capture_released_out_of_order",
                    "Capture handle released before a later one, later panic hooks are removed too"
                );
            }
            restore_panic_hook(hook.previous);
        }

        if self.registered {
            self.registered = false;
            if let Ok(mut active) = ACTIVE.write() {
                let ours = active
                    .as_ref()
                    .map(|p| Arc::ptr_eq(p, &self.pipeline))
                    .unwrap_or(false);
                if ours {
                    *active = None;
                }
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Manual entry point using the installed pipeline.
///
/// Returns `false` when nothing is installed.
pub fn log_server_error(
    error: impl Into<Failure>,
    context: &str,
    request: Option<&RequestInfo>,
) -> bool {
    let pipeline = ACTIVE.read().ok().and_then(|active| active.clone());
    match pipeline {
        Some(pipeline) => {
            pipeline.dispatch(&error.into(), context, request);
            true
        }
        None => false,
    }
}

/// Render-time error boundary entry point using the installed pipeline
pub fn log_route_error(error: impl Into<Failure>, route: &str) -> bool {
    log_server_error(error, route, None)
}

/// Errors pass through; any other reason becomes a synthetic error
pub fn rejection_failure(reason: Failure) -> Failure {
    match reason {
        known @ Failure::Known { .. } => known,
        raw => Failure::known(
            "Error",
            format!("Unhandled promise rejection: {}", raw.stringify()),
        ),
    }
}

fn report_rejection_to(pipeline: &Pipeline, reason: Failure) {
    pipeline.dispatch(
        &rejection_failure(reason),
        CaptureContext::UNHANDLED_REJECTION,
        None,
    );
}

fn install_panic_hook(pipeline: Arc<Pipeline>) -> InstalledHook {
    let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
    let chained = Arc::clone(&previous);

    panic::set_hook(Box::new(move |info| {
        // Sink failures on the helper thread are caught by `fan_out`
        if HOOK_WORKER.with(Cell::get) {
            return;
        }

        let failure = failure_from_panic(info);
        dispatch_from_hook(&pipeline, &failure, !reporter::is_delivering());
        // Keep the default fatal behavior
        chained(info);
    }));

    InstalledHook {
        id: register_hook(),
        previous,
    }
}

fn register_hook() -> u64 {
    let id = NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed);
    HOOKS.lock().unwrap_or_else(|e| e.into_inner()).push(id);
    id
}

/// Forget hook `id`. Returns whether it was the most recent one.
fn unregister_hook(id: u64) -> bool {
    let mut hooks = HOOKS.lock().unwrap_or_else(|e| e.into_inner());
    let latest = hooks.last() == Some(&id);
    hooks.retain(|hook| *hook != id);
    latest
}

/// Run the pipeline for a panic on a helper thread and wait for it.
///
/// The helper inherits the panicking thread's runtime so reports can still be
/// spawned. If no thread can be started the record is dropped.
fn dispatch_from_hook(pipeline: &Pipeline, failure: &Failure, remote: bool) {
    let runtime = Handle::try_current().ok();

    std::thread::scope(|scope| {
        let worker = std::thread::Builder::new()
            .name("faultline-panic".to_string())
            .spawn_scoped(scope, || {
                HOOK_WORKER.with(|flag| flag.set(true));
                let _entered = runtime.as_ref().map(Handle::enter);
                if remote {
                    pipeline.dispatch(failure, CaptureContext::UNCAUGHT_EXCEPTION, None);
                } else {
                    pipeline.dispatch_local(failure, CaptureContext::UNCAUGHT_EXCEPTION);
                }
            });

        if let Ok(worker) = worker {
            let _ = worker.join();
        }
    });
}

fn restore_panic_hook(previous: Arc<PanicHook>) {
    // take_hook/set_hook panic on a panicking thread
    if std::thread::panicking() {
        return;
    }
    drop(panic::take_hook());
    panic::set_hook(Box::new(move |info| previous(info)));
}

/// Failure carried by a panic payload
pub(crate) fn failure_from_panic(info: &PanicHookInfo<'_>) -> Failure {
    let location = info
        .location()
        .map(|l| format!("at {}:{}:{}", l.file(), l.line(), l.column()));

    let stack = {
        let backtrace = Backtrace::capture();
        match (backtrace.status(), location) {
            (BacktraceStatus::Captured, Some(location)) => Some(format!("{}\n{}", location, backtrace)),
            (BacktraceStatus::Captured, None) => Some(backtrace.to_string()),
            (_, location) => location,
        }
    };

    let failure = payload_failure(info.payload());
    match (failure, stack) {
        (Failure::Known { stack: None, name, message }, Some(stack)) => Failure::Known {
            name,
            message,
            stack: Some(stack),
        },
        (failure, _) => failure,
    }
}

fn payload_failure(payload: &(dyn Any + Send)) -> Failure {
    if let Some(failure) = payload.downcast_ref::<Failure>() {
        failure.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        Failure::known("panic", *s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Failure::known("panic", s.as_str())
    } else {
        Failure::known("panic", "unknown panic payload")
    }
}
