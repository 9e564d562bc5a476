//! Redaction of sensitive data before a record reaches any sink

use crate::{config::PrivacyConfig, record::ErrorRecord, Error, Result};
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

/// Produces redacted copies of error records
#[derive(Debug, Clone)]
pub struct RecordSanitizer {
    patterns: Vec<Regex>,
    redacted_headers: Vec<String>,
}

impl RecordSanitizer {
    /// Create a sanitizer from privacy settings
    pub fn new(config: &PrivacyConfig) -> Result<Self> {
        let patterns = config
            .redaction_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| Error::Config {
                    message: format!("Invalid redaction pattern '{}': {}", pattern, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            redacted_headers: config
                .redacted_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        })
    }

    /// Sanitizer that leaves records untouched
    pub fn passthrough() -> Self {
        Self {
            patterns: Vec::new(),
            redacted_headers: Vec::new(),
        }
    }

    /// Redact free text with the configured patterns
    pub fn sanitize_text(&self, text: &str) -> String {
        let mut sanitized = text.to_string();

        for pattern in &self.patterns {
            sanitized = pattern
                .replace_all(&sanitized, |caps: &regex::Captures| match caps.get(1) {
                    // Keep the parameter name but redact the value
                    Some(prefix) => format!("{}{}", prefix.as_str(), REDACTED),
                    None => REDACTED.to_string(),
                })
                .into_owned();
        }

        sanitized
    }

    /// Redacted copy of `record`
    pub fn sanitize(&self, record: &ErrorRecord) -> ErrorRecord {
        let mut sanitized = record.clone();
        sanitized.message = self.sanitize_text(&record.message);
        sanitized.stack = self.sanitize_text(&record.stack);

        if let Some(request) = sanitized.request.as_mut() {
            request.url = self.sanitize_text(&request.url);
            for (name, value) in request.headers.iter_mut() {
                if self.redacted_headers.iter().any(|h| h == name) {
                    *value = REDACTED.to_string();
                } else {
                    *value = self.sanitize_text(value);
                }
            }
        }

        sanitized
    }
}
