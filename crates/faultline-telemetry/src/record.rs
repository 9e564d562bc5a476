//! Canonical error record and the request metadata that can accompany it

use reqwest::header::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// Stack value used when a failure carries no stack trace of its own
pub const NO_STACK_TRACE: &str = "No stack trace available";

/// Placeholder for request fields that were not supplied
pub const UNKNOWN: &str = "unknown";

/// Labels identifying where a record was captured.
///
/// Used for log correlation only. Render-time errors use the route id instead
/// of one of these constants.
pub struct CaptureContext;

impl CaptureContext {
    pub const UNCAUGHT_EXCEPTION: &'static str = "uncaughtException";
    pub const UNHANDLED_REJECTION: &'static str = "unhandledRejection";
    pub const FETCH_ERROR: &'static str = "fetch-error";
    pub const FETCH_RESPONSE: &'static str = "fetch-response";
}

/// Normalized representation of a captured failure.
///
/// Built by [`crate::normalize`] and handed to both sinks. Fields are private
/// so a record cannot change after construction, and records can only be
/// serialized, never read back:
///
/// ```compile_fail
/// let _: faultline_telemetry::ErrorRecord = serde_json::from_str("{}").unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub(crate) message: String,
    pub(crate) stack: String,
    pub(crate) name: String,
    pub(crate) context: String,
    pub(crate) timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) request: Option<RequestRecord>,
}

impl ErrorRecord {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// RFC 3339 UTC timestamp taken when the record was produced
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn request(&self) -> Option<&RequestRecord> {
        self.request.as_ref()
    }

    /// Whether the stack carries more than a repeat of the message
    pub fn has_distinct_stack(&self) -> bool {
        self.stack != self.message
    }
}

/// Request metadata projected into an [`ErrorRecord`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(rename = "statusText", skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Raw request details supplied by a capture point or a manual caller.
///
/// Every field is optional; the normalizer fills the gaps.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub url: Option<String>,
    pub method: Option<String>,
    /// Header name/value pairs. A name may repeat for multi-valued headers.
    pub headers: Vec<(String, String)>,
    pub status: Option<u16>,
    pub status_text: Option<String>,
    /// Platform-specific request metadata (client address, edge ray id, ...)
    pub metadata: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            method: Some(method.into()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append every value of every header in `headers`
    pub fn with_header_map(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            self.headers.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        self
    }

    pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        self.status = Some(status);
        self.status_text = Some(status_text.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
