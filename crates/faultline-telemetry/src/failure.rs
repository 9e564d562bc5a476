//! Failure values accepted by the pipeline

use serde_json::Value;
use std::backtrace::BacktraceStatus;
use std::error::Error as StdError;
use std::fmt;

/// Anything a capture point can observe.
///
/// `Known` is an error whose parts are already understood. `Raw` is any other
/// value; `Value::Null` stands for an absent value.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    Known {
        name: String,
        message: String,
        stack: Option<String>,
    },
    Raw(Value),
}

impl Failure {
    /// Synthetic error with an explicit name and message and no stack
    pub fn known(name: impl Into<String>, message: impl Into<String>) -> Self {
        Failure::Known {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(self, stack: impl Into<String>) -> Self {
        match self {
            Failure::Known { name, message, .. } => Failure::Known {
                name,
                message,
                stack: Some(stack.into()),
            },
            raw => raw,
        }
    }

    /// Describe a typed error. The name is the error's short type name and
    /// the stack lists its `source()` chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        Failure::Known {
            name: short_type_name(std::any::type_name::<E>()),
            message: err.to_string(),
            stack: source_chain(err.source()),
        }
    }

    /// Text used wherever the failure has to be printed as a whole
    pub fn stringify(&self) -> String {
        match self {
            Failure::Known { name, message, .. } if message.is_empty() => name.clone(),
            Failure::Known { name, message, .. } => format!("{}: {}", name, message),
            Failure::Raw(value) => stringify_value(value),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

/// Textual form of a raw value: `undefined` for null, strings verbatim,
/// everything else as compact JSON
pub(crate) fn stringify_value(value: &Value) -> String {
    match value {
        Value::Null => "undefined".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `std::io::error::Error` -> `Error`, `dyn core::error::Error` -> `Error`
pub(crate) fn short_type_name(full: &str) -> String {
    let without_generics = full.split('<').next().unwrap_or(full);
    let without_dyn = without_generics.trim_start_matches("dyn ");
    let short = without_dyn.rsplit("::").next().unwrap_or(without_dyn).trim();
    if short.is_empty() {
        "Error".to_string()
    } else {
        short.to_string()
    }
}

fn source_chain(mut source: Option<&(dyn StdError + 'static)>) -> Option<String> {
    let mut lines = Vec::new();
    while let Some(err) = source {
        lines.push(format!("caused by: {}", err));
        source = err.source();
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

impl From<String> for Failure {
    fn from(value: String) -> Self {
        Failure::Raw(Value::String(value))
    }
}

impl From<&str> for Failure {
    fn from(value: &str) -> Self {
        Failure::Raw(Value::String(value.to_string()))
    }
}

impl From<Value> for Failure {
    fn from(value: Value) -> Self {
        Failure::Raw(value)
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::from_error(&err)
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        Failure::from_error(&err)
    }
}

impl From<crate::Error> for Failure {
    fn from(err: crate::Error) -> Self {
        Failure::from_error(&err)
    }
}

impl From<Box<dyn StdError + Send + Sync>> for Failure {
    fn from(err: Box<dyn StdError + Send + Sync>) -> Self {
        Failure::Known {
            name: "Error".to_string(),
            message: err.to_string(),
            stack: source_chain(err.source()),
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        let mut stack = source_chain(err.source());
        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            stack = Some(match stack {
                Some(chain) => format!("{}\n{}", chain, backtrace),
                None => backtrace.to_string(),
            });
        }

        Failure::Known {
            name: "Error".to_string(),
            message: err.to_string(),
            stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("std::io::error::Error"), "Error");
        assert_eq!(short_type_name("dyn core::error::Error"), "Error");
        assert_eq!(short_type_name("my_crate::ParseFailure<u8>"), "ParseFailure");
        assert_eq!(short_type_name(""), "Error");
    }

    #[test]
    fn test_from_error_renders_source_chain() {
        let err = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        };

        match Failure::from_error(&err) {
            Failure::Known {
                name,
                message,
                stack,
            } => {
                assert_eq!(name, "Outer");
                assert_eq!(message, "outer failure");
                assert_eq!(stack.as_deref(), Some("caused by: disk on fire"));
            }
            raw => panic!("expected a known failure, got {:?}", raw),
        }
    }

    #[test]
    fn test_stringify_raw_values() {
        assert_eq!(Failure::Raw(Value::Null).stringify(), "undefined");
        assert_eq!(Failure::from("boom").stringify(), "boom");
        assert_eq!(Failure::from(json!(42)).stringify(), "42");
        assert_eq!(Failure::from(json!({"code": 7})).stringify(), r#"{"code":7}"#);
    }

    #[test]
    fn test_anyhow_context_becomes_chain() {
        let err = anyhow::anyhow!("root cause").context("while loading profile");

        match Failure::from(err) {
            Failure::Known { message, stack, .. } => {
                assert_eq!(message, "while loading profile");
                assert!(stack.unwrap().starts_with("caused by: root cause"));
            }
            raw => panic!("expected a known failure, got {:?}", raw),
        }
    }
}
