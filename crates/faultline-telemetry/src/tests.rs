//! End-to-end tests for the capture pipeline

#[cfg(test)]
mod integration_tests {
    use crate::{
        capture::CaptureBuilder,
        config::ObservabilityConfig,
        failure::Failure,
        fetch::Fetch,
        record::{ErrorRecord, RequestInfo},
        reporter::ErrorReporter,
        test_support::SharedBuffer,
        Error, Result,
    };
    use async_trait::async_trait;
    use serial_test::serial;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    /// Backend that remembers what it was asked to deliver
    #[derive(Default)]
    struct RecordingReporter {
        records: Mutex<Vec<ErrorRecord>>,
    }

    impl RecordingReporter {
        fn names(&self) -> Vec<String> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.name().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl ErrorReporter for RecordingReporter {
        async fn capture(&self, record: &ErrorRecord) -> Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// Backend that never answers in time
    struct HangingReporter;

    #[async_trait]
    impl ErrorReporter for HangingReporter {
        async fn capture(&self, _record: &ErrorRecord) -> Result<()> {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "hanging"
        }
    }

    /// Backend that always fails
    struct RejectingReporter;

    #[async_trait]
    impl ErrorReporter for RejectingReporter {
        async fn capture(&self, _record: &ErrorRecord) -> Result<()> {
            Err(Error::Delivery {
                status: 503,
                message: "unavailable".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "rejecting"
        }
    }

    /// Backend that panics while delivering
    struct PanickingReporter {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ErrorReporter for PanickingReporter {
        async fn capture(&self, _record: &ErrorRecord) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            panic!("reporter bug");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    fn quiet_config() -> ObservabilityConfig {
        let mut config = ObservabilityConfig::default();
        config.logging.console_enabled = false;
        config.reporter.timeout_secs = 1;
        config
    }

    async fn serve_status(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status_line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    #[serial]
    async fn test_both_sinks_receive_manual_errors() {
        let buffer = SharedBuffer::default();
        let reporter = Arc::new(RecordingReporter::default());
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .with_reporter(reporter.clone())
            .install();

        let info = RequestInfo::new("https://shop.example.com/checkout", "POST")
            .with_header("Authorization", "Bearer abc.def")
            .with_metadata("cf-connecting-ip", "198.51.100.4");
        capture.log_server_error(Failure::known("CheckoutError", "card declined"), "checkout", Some(&info));

        assert!(capture.flush(Duration::from_secs(1)).await);

        assert_eq!(reporter.names(), vec!["CheckoutError".to_string()]);
        let delivered = reporter.records.lock().unwrap()[0].clone();
        assert_eq!(
            delivered.request().unwrap().headers["authorization"],
            "[REDACTED]"
        );

        let contents = buffer.contents();
        assert!(contents.contains(
            "[SERVER ERROR - checkout] POST https://shop.example.com/checkout CheckoutError: card declined"
        ));
        assert!(!contents.contains("abc.def"));
    }

    #[tokio::test]
    #[serial]
    async fn test_disabled_reporter_still_logs_both_lines() {
        let buffer = SharedBuffer::default();
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .install();
        assert!(!capture.pipeline().reporter().is_enabled());

        capture.log_server_error("database unreachable", "startup", None);

        let contents = buffer.contents();
        let lines: Vec<_> = contents.lines().collect();
        assert!(lines[0].starts_with("[SERVER ERROR] {"));
        assert_eq!(lines[1], "[SERVER ERROR - startup] Error: database unreachable");
    }

    #[tokio::test]
    #[serial]
    async fn test_failing_reporter_does_not_affect_logging() {
        let buffer = SharedBuffer::default();
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .with_reporter(Arc::new(RejectingReporter))
            .install();

        capture.log_server_error("first", "", None);
        capture.log_server_error("second", "", None);
        assert!(capture.flush(Duration::from_secs(1)).await);

        assert_eq!(buffer.entries().len(), 2);
    }

    #[tokio::test]
    #[serial]
    async fn test_hanging_reporter_does_not_delay_callers() {
        let buffer = SharedBuffer::default();
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .with_reporter(Arc::new(HangingReporter))
            .install();
        let url = serve_status("500 Internal Server Error").await;
        let client = capture.observe_fetch(reqwest::Client::new());

        let started = Instant::now();
        let response = client
            .fetch(reqwest::Client::new().get(&url).build().unwrap())
            .await
            .unwrap();

        assert_eq!(response.status().as_u16(), 500);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(buffer.entries().len(), 1);
        assert_eq!(capture.pipeline().reporter().in_flight(), 1);

        // The delivery timeout ends the hung report
        assert!(capture.flush(Duration::from_secs(3)).await);
    }

    #[tokio::test]
    #[serial]
    async fn test_panicking_reporter_is_not_reported_again() {
        let buffer = SharedBuffer::default();
        let reporter = Arc::new(PanickingReporter {
            calls: Mutex::new(0),
        });
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .with_reporter(reporter.clone())
            .install();

        capture.log_server_error("original failure", "jobs", None);
        assert!(capture.flush(Duration::from_secs(2)).await);

        assert_eq!(*reporter.calls.lock().unwrap(), 1);

        let entries = buffer.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["message"], "original failure");
        assert_eq!(entries[1]["context"], "uncaughtException");
        assert_eq!(entries[1]["message"], "reporter bug");

        capture.uninstall();
    }

    #[tokio::test]
    #[serial]
    async fn test_rejection_is_reported_without_terminating() {
        let buffer = SharedBuffer::default();
        let reporter = Arc::new(RecordingReporter::default());
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .with_reporter(reporter.clone())
            .install();

        let task = capture.spawn_observed(async {
            sleep(Duration::from_millis(5)).await;
            Err::<(), _>(serde_json::json!({"code": "E_TIMEOUT"}))
        });
        assert_eq!(task.await.unwrap(), None);

        capture.report_rejection(Failure::known("QuotaError", "quota exceeded"));
        assert!(capture.flush(Duration::from_secs(1)).await);

        let entries = buffer.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0]["message"],
            r#"Unhandled promise rejection: {"code":"E_TIMEOUT"}"#
        );
        assert_eq!(entries[1]["name"], "QuotaError");
        assert_eq!(
            reporter.names(),
            vec!["Error".to_string(), "QuotaError".to_string()]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_records_are_timestamped_when_produced() {
        let buffer = SharedBuffer::default();
        let capture = CaptureBuilder::new(quiet_config())
            .with_writer(buffer.clone())
            .install();

        let before = chrono::Utc::now();
        capture.log_server_error("late", "", None);
        let after = chrono::Utc::now();

        let entries = buffer.entries();
        let timestamp =
            chrono::DateTime::parse_from_rfc3339(entries[0]["timestamp"].as_str().unwrap())
                .unwrap()
                .timestamp_millis();
        assert!(timestamp >= before.timestamp_millis());
        assert!(timestamp <= after.timestamp_millis());
    }
}
