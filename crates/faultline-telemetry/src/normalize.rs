//! Conversion of failures into [`ErrorRecord`]s

use crate::failure::{stringify_value, Failure};
use crate::record::{ErrorRecord, RequestInfo, RequestRecord, NO_STACK_TRACE, UNKNOWN};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

const DEFAULT_NAME: &str = "Error";
const EMPTY_MESSAGE: &str = "Unknown error";

/// Build the canonical record for `failure`.
///
/// Total over every input: no field inspected here can make it fail or panic.
/// The timestamp is taken now, not when the failure happened.
pub fn normalize(failure: &Failure, context: &str, request: Option<&RequestInfo>) -> ErrorRecord {
    let (name, message, stack) = match failure {
        Failure::Known {
            name,
            message,
            stack,
        } => (
            non_empty(name).unwrap_or(DEFAULT_NAME).to_string(),
            non_empty(message)
                .map(str::to_string)
                .unwrap_or_else(|| fallback_message(failure)),
            stack.as_deref().and_then(non_empty).map(str::to_string),
        ),
        Failure::Raw(value) => normalize_raw(value),
    };

    ErrorRecord {
        message,
        stack: stack.unwrap_or_else(|| NO_STACK_TRACE.to_string()),
        name,
        context: context.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        request: request.map(project_request),
    }
}

fn normalize_raw(value: &Value) -> (String, String, Option<String>) {
    // Error-shaped JSON, e.g. a decoded upstream error body
    if let Value::Object(fields) = value {
        if let Some(message) = fields.get("message").and_then(Value::as_str).and_then(non_empty) {
            let name = fields
                .get("name")
                .and_then(Value::as_str)
                .and_then(non_empty)
                .unwrap_or(DEFAULT_NAME);
            let stack = fields
                .get("stack")
                .and_then(Value::as_str)
                .and_then(non_empty)
                .map(str::to_string);
            return (name.to_string(), message.to_string(), stack);
        }
    }

    let text = stringify_value(value);
    let message = if text.is_empty() {
        EMPTY_MESSAGE.to_string()
    } else {
        text
    };
    (DEFAULT_NAME.to_string(), message, None)
}

fn fallback_message(failure: &Failure) -> String {
    let text = failure.stringify();
    if text.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        text
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

fn project_request(info: &RequestInfo) -> RequestRecord {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &info.headers {
        headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }

    RequestRecord {
        url: info
            .url
            .as_deref()
            .and_then(non_empty)
            .unwrap_or(UNKNOWN)
            .to_string(),
        method: info
            .method
            .as_deref()
            .and_then(non_empty)
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        headers,
        status: info.status,
        status_text: info.status_text.clone(),
        metadata: info.metadata.clone(),
    }
}
