//! Remote sink: fire-and-forget delivery to a Sentry-compatible service

use crate::config::ReporterConfig;
use crate::record::ErrorRecord;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

tokio::task_local! {
    /// Set while a report is being delivered
    static DELIVERING: ();
}

/// Whether the current task is delivering a report
pub(crate) fn is_delivering() -> bool {
    DELIVERING.try_with(|_| ()).is_ok()
}

/// Backend of the remote sink
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    /// Send one record to the service
    async fn capture(&self, record: &ErrorRecord) -> Result<()>;

    /// Name used in diagnostics
    fn name(&self) -> &'static str;
}

/// Parsed `https://<public_key>@<host>[:port]/[prefix/]<project_id>` DSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    host: String,
    port: Option<u16>,
    path_prefix: String,
    project_id: String,
}

impl Dsn {
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Endpoint accepting JSON events
    pub fn store_url(&self) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        format!(
            "{}://{}{}{}/api/{}/store/",
            self.scheme, self.host, port, self.path_prefix, self.project_id
        )
    }

    /// Value of the `X-Sentry-Auth` header
    pub fn auth_header(&self) -> String {
        format!(
            "Sentry sentry_version=7, sentry_client=faultline/{}, sentry_key={}",
            env!("CARGO_PKG_VERSION"),
            self.public_key
        )
    }
}

impl FromStr for Dsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| Error::Dsn {
            dsn: s.to_string(),
            message: message.to_string(),
        };

        let url = Url::parse(s.trim()).map_err(|e| invalid(&e.to_string()))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(invalid("scheme must be http or https"));
        }
        if url.username().is_empty() {
            return Err(invalid("missing public key"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;

        let path = url.path().trim_end_matches('/');
        let (prefix, project_id) = path
            .rsplit_once('/')
            .ok_or_else(|| invalid("missing project id"))?;
        if project_id.is_empty() {
            return Err(invalid("missing project id"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            public_key: url.username().to_string(),
            host: host.to_string(),
            port: url.port(),
            path_prefix: prefix.to_string(),
            project_id: project_id.to_string(),
        })
    }
}

/// Event attributes that do not come from the record
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub send_default_pii: bool,
    pub environment: Option<String>,
    pub release: Option<String>,
}

impl From<&ReporterConfig> for ReportOptions {
    fn from(config: &ReporterConfig) -> Self {
        Self {
            send_default_pii: config.send_default_pii,
            environment: config.environment.clone(),
            release: config.release.clone(),
        }
    }
}

/// Build the JSON event for `record`.
///
/// Request headers and request metadata (client addresses and the like) are
/// only attached when `send_default_pii` is set.
pub fn event_payload(record: &ErrorRecord, options: &ReportOptions) -> Value {
    let mut event = json!({
        "event_id": Uuid::new_v4().simple().to_string(),
        "timestamp": record.timestamp(),
        "level": "error",
        "platform": "native",
        "logger": "faultline",
        "exception": {
            "values": [{
                "type": record.name(),
                "value": record.message(),
            }]
        },
        "extra": {
            "stack": record.stack(),
        },
    });

    if !record.context().is_empty() {
        event["tags"] = json!({ "context": record.context() });
    }
    if let Some(environment) = &options.environment {
        event["environment"] = json!(environment);
    }
    if let Some(release) = &options.release {
        event["release"] = json!(release);
    }

    if let Some(request) = record.request() {
        let mut payload = json!({
            "url": request.url,
            "method": request.method,
        });
        if options.send_default_pii {
            if !request.headers.is_empty() {
                payload["headers"] = json!(request.headers);
            }
            if !request.metadata.is_empty() {
                payload["env"] = json!(request.metadata);
            }
        }
        event["request"] = payload;

        if let Some(status) = request.status {
            event["extra"]["status"] = json!(status);
        }
        if let Some(status_text) = &request.status_text {
            event["extra"]["statusText"] = json!(status_text);
        }
    }

    event
}

/// Delivers records to a Sentry store endpoint over HTTP
pub struct SentryReporter {
    client: Client,
    dsn: Dsn,
    options: ReportOptions,
}

impl SentryReporter {
    pub fn new(dsn: Dsn, options: ReportOptions, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("faultline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            dsn,
            options,
        })
    }

    pub fn dsn(&self) -> &Dsn {
        &self.dsn
    }
}

#[async_trait]
impl ErrorReporter for SentryReporter {
    async fn capture(&self, record: &ErrorRecord) -> Result<()> {
        let event = event_payload(record, &self.options);

        let response = self
            .client
            .post(self.dsn.store_url())
            .header("X-Sentry-Auth", self.dsn.auth_header())
            .json(&event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Delivery {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "sentry"
    }
}

/// Adapter between the pipeline and a reporting backend.
///
/// Each report runs in its own tracked task; callers never wait for it and
/// never see its outcome. Without a backend every call is a no-op.
pub struct RemoteReporter {
    backend: Option<Arc<dyn ErrorReporter>>,
    runtime: Option<Handle>,
    tracker: TaskTracker,
    timeout: Duration,
}

impl RemoteReporter {
    /// Reporter that drops everything
    pub fn disabled() -> Self {
        Self {
            backend: None,
            runtime: None,
            tracker: drain_tracker(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Reporter delivering through `backend`.
    ///
    /// Reports are spawned on the runtime current at construction, or on the
    /// runtime current at report time when there was none.
    pub fn with_backend(backend: Arc<dyn ErrorReporter>, timeout: Duration) -> Self {
        Self {
            backend: Some(backend),
            runtime: Handle::try_current().ok(),
            tracker: drain_tracker(),
            timeout,
        }
    }

    /// Build the Sentry reporter described by `config`. A missing or
    /// malformed DSN yields a disabled reporter instead of an error.
    pub fn from_config(config: &ReporterConfig) -> Self {
        let Some(raw) = config.dsn.as_deref().map(str::trim).filter(|d| !d.is_empty()) else {
            tracing::info!(
                telemetry.event = "reporter_disabled",
                "No DSN configured, remote error reporting disabled"
            );
            return Self::disabled();
        };

        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let reporter = raw
            .parse::<Dsn>()
            .and_then(|dsn| SentryReporter::new(dsn, ReportOptions::from(config), timeout));

        match reporter {
            Ok(reporter) => {
                tracing::info!(
                    telemetry.event = "reporter_initialized",
                    reporter.host = reporter.dsn().host(),
                    reporter.project = reporter.dsn().project_id(),
                    reporter.send_default_pii = config.send_default_pii,
                    "Remote error reporting enabled"
                );
                Self::with_backend(Arc::new(reporter), timeout)
            }
            Err(e) => {
                tracing::warn!(
                    telemetry.event = "reporter_disabled",
                    error = %e,
                    "Remote error reporting disabled"
                );
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Hand `record` to the backend without waiting for the result
    pub fn report(&self, record: &ErrorRecord) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            tracing::warn!(
                telemetry.event = "report_dropped",
                reporter = backend.name(),
                "No async runtime available, error report dropped"
            );
            return;
        };

        let backend = Arc::clone(backend);
        let record = record.clone();
        let timeout = self.timeout;

        self.tracker.spawn_on(
            DELIVERING.scope((), deliver(backend, record, timeout)),
            &runtime,
        );
    }

    /// Wait up to `timeout` for in-flight reports. Returns whether all of
    /// them finished.
    pub async fn flush(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }

    /// Number of reports still being delivered
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

impl fmt::Debug for RemoteReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteReporter")
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("in_flight", &self.tracker.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Closed tracker: spawning still works and `wait` resolves whenever no
/// report is in flight, so concurrent flushes never interfere.
fn drain_tracker() -> TaskTracker {
    let tracker = TaskTracker::new();
    tracker.close();
    tracker
}

async fn deliver(backend: Arc<dyn ErrorReporter>, record: ErrorRecord, timeout: Duration) {
    match tokio::time::timeout(timeout, backend.capture(&record)).await {
        Ok(Ok(())) => {
            tracing::debug!(
                telemetry.event = "report_delivered",
                reporter = backend.name(),
                error.name = record.name(),
                "Error report delivered"
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(
                telemetry.event = "report_failed",
                reporter = backend.name(),
                error = %e,
                "Error report delivery failed"
            );
        }
        Err(_) => {
            tracing::warn!(
                telemetry.event = "report_timed_out",
                reporter = backend.name(),
                timeout_ms = timeout.as_millis() as u64,
                "Error report delivery timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::Failure;
    use crate::normalize;
    use crate::record::RequestInfo;
    use mockall::mock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    mock! {
        pub Backend {}

        #[async_trait]
        impl ErrorReporter for Backend {
            async fn capture(&self, record: &ErrorRecord) -> Result<()>;
            fn name(&self) -> &'static str;
        }
    }

    fn sample_record() -> ErrorRecord {
        let info = RequestInfo::new("https://shop.example.com/cart", "POST")
            .with_header("Cookie", "session=1")
            .with_metadata("client_ip", "203.0.113.9")
            .with_status(503, "Service Unavailable");
        normalize(
            &Failure::known("HTTPError", "HTTP 503: Service Unavailable"),
            "fetch-response",
            Some(&info),
        )
    }

    #[test]
    fn test_dsn_parsing() {
        let dsn: Dsn = "https://abc123@o42.ingest.example.com/1337".parse().unwrap();
        assert_eq!(dsn.public_key(), "abc123");
        assert_eq!(dsn.project_id(), "1337");
        assert_eq!(
            dsn.store_url(),
            "https://o42.ingest.example.com/api/1337/store/"
        );
        assert!(dsn.auth_header().contains("sentry_key=abc123"));
        assert!(dsn.auth_header().starts_with("Sentry sentry_version=7"));

        let dsn: Dsn = "http://key@localhost:9000/prefix/5/".parse().unwrap();
        assert_eq!(dsn.store_url(), "http://localhost:9000/prefix/api/5/store/");
    }

    #[test]
    fn test_invalid_dsns_are_rejected() {
        for raw in [
            "",
            "not a url",
            "https://errors.example.com/1",
            "https://key@errors.example.com/",
            "ftp://key@errors.example.com/1",
        ] {
            assert!(raw.parse::<Dsn>().is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_payload_with_pii() {
        let options = ReportOptions {
            send_default_pii: true,
            environment: Some("production".to_string()),
            release: Some("shop@1.2.3".to_string()),
        };
        let event = event_payload(&sample_record(), &options);

        assert_eq!(event["level"], "error");
        assert_eq!(event["exception"]["values"][0]["type"], "HTTPError");
        assert_eq!(event["tags"]["context"], "fetch-response");
        assert_eq!(event["environment"], "production");
        assert_eq!(event["release"], "shop@1.2.3");
        assert_eq!(event["request"]["method"], "POST");
        assert_eq!(event["request"]["headers"]["cookie"], "session=1");
        assert_eq!(event["request"]["env"]["client_ip"], "203.0.113.9");
        assert_eq!(event["extra"]["status"], 503);
        assert_eq!(event["event_id"].as_str().unwrap().len(), 32);
    }

    #[test]
    fn test_payload_without_pii_drops_headers_and_metadata() {
        let event = event_payload(&sample_record(), &ReportOptions::default());

        assert_eq!(event["request"]["url"], "https://shop.example.com/cart");
        assert!(event["request"].get("headers").is_none());
        assert!(event["request"].get("env").is_none());
        assert!(event.get("environment").is_none());
    }

    #[test]
    fn test_missing_or_bad_dsn_disables_reporting() {
        let mut config = crate::ObservabilityConfig::default().reporter;
        assert!(!RemoteReporter::from_config(&config).is_enabled());

        config.dsn = Some("definitely not a dsn".to_string());
        let reporter = RemoteReporter::from_config(&config);
        assert!(!reporter.is_enabled());

        // Reporting through a disabled reporter is a no-op
        reporter.report(&sample_record());
        assert_eq!(reporter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_report_reaches_backend() {
        let mut backend = MockBackend::new();
        backend
            .expect_capture()
            .withf(|record| record.name() == "HTTPError")
            .times(1)
            .returning(|_| Ok(()));
        backend.expect_name().return_const("mock");

        let reporter = RemoteReporter::with_backend(Arc::new(backend), Duration::from_secs(1));
        reporter.report(&sample_record());

        assert!(reporter.flush(Duration::from_secs(1)).await);
        assert_eq!(reporter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_swallowed() {
        let mut backend = MockBackend::new();
        backend.expect_capture().times(1).returning(|_| {
            Err(Error::System {
                message: "service unavailable".to_string(),
            })
        });
        backend.expect_name().return_const("mock");

        let reporter = RemoteReporter::with_backend(Arc::new(backend), Duration::from_secs(1));
        reporter.report(&sample_record());

        assert!(reporter.flush(Duration::from_secs(1)).await);
    }

    /// Backend that takes a while to answer
    struct SlowBackend(Duration);

    #[async_trait]
    impl ErrorReporter for SlowBackend {
        async fn capture(&self, _record: &ErrorRecord) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_concurrent_flushes_are_independent() {
        let reporter = RemoteReporter::with_backend(
            Arc::new(SlowBackend(Duration::from_millis(200))),
            Duration::from_secs(5),
        );
        reporter.report(&sample_record());

        let (short, long) = tokio::join!(
            reporter.flush(Duration::from_millis(10)),
            reporter.flush(Duration::from_secs(2)),
        );

        assert!(!short);
        assert!(long);
        assert_eq!(reporter.in_flight(), 0);

        // The reporter stays usable after a timed-out flush
        reporter.report(&sample_record());
        assert!(reporter.flush(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_sentry_reporter_posts_to_store_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        let dsn: Dsn = format!("http://publickey@127.0.0.1:{}/77", port)
            .parse()
            .unwrap();
        let reporter =
            SentryReporter::new(dsn, ReportOptions::default(), Duration::from_secs(5)).unwrap();

        reporter.capture(&sample_record()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/77/store/ HTTP/1.1"));
        assert!(request
            .to_ascii_lowercase()
            .contains("x-sentry-auth: sentry sentry_version=7"));
        assert!(request.contains("\"HTTPError\""));
        assert!(!request.contains("session=1"));
    }
}
