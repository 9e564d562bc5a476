//! Local sink: `[SERVER ERROR]` entries for the platform's log aggregator

use crate::config::LogFormat;
use crate::record::ErrorRecord;
use std::io::Write;
use tracing_subscriber::fmt::{writer::BoxMakeWriter, MakeWriter};

/// Prefix the log aggregator matches on
pub const SERVER_ERROR_TAG: &str = "[SERVER ERROR]";

/// Writes each record as a structured entry, a one-line summary and, when a
/// real trace exists, a stack trace line.
///
/// Writes are synchronous and best-effort: a failing sink is ignored.
pub struct DualSinkLogger {
    writer: BoxMakeWriter,
    format: LogFormat,
}

impl DualSinkLogger {
    /// Logger writing to standard error
    pub fn stderr(format: LogFormat) -> Self {
        Self::new(format, std::io::stderr)
    }

    pub fn new<W>(format: LogFormat, writer: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        Self {
            writer: BoxMakeWriter::new(writer),
            format,
        }
    }

    pub fn log(&self, record: &ErrorRecord) {
        self.write_line(&structured_line(record, self.format));
        self.write_line(&summary_line(record));
        if record.has_distinct_stack() {
            self.write_line(&format!("Stack trace: {}", record.stack()));
        }
    }

    fn write_line(&self, line: &str) {
        let mut writer = self.writer.make_writer();
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let _ = writer.write_all(buf.as_bytes());
    }
}

impl std::fmt::Debug for DualSinkLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualSinkLogger")
            .field("format", &self.format)
            .finish()
    }
}

/// `[SERVER ERROR] {...}`
pub fn structured_line(record: &ErrorRecord, format: LogFormat) -> String {
    let serialized = match format {
        LogFormat::Pretty => serde_json::to_string_pretty(record),
        LogFormat::Json | LogFormat::Compact => serde_json::to_string(record),
    };

    match serialized {
        Ok(json) => format!("{} {}", SERVER_ERROR_TAG, json),
        Err(_) => format!("{} {:?}", SERVER_ERROR_TAG, record),
    }
}

/// `[SERVER ERROR - <context>] <METHOD> <url> <name>: <message>`
pub fn summary_line(record: &ErrorRecord) -> String {
    let mut line = String::from("[SERVER ERROR");
    if !record.context().is_empty() {
        line.push_str(" - ");
        line.push_str(record.context());
    }
    line.push(']');

    if let Some(request) = record.request() {
        line.push(' ');
        line.push_str(&request.method);
        line.push(' ');
        line.push_str(&request.url);
    }

    line.push(' ');
    line.push_str(record.name());
    line.push_str(": ");
    line.push_str(record.message());
    line
}
