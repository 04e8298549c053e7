//! Error types for goss
//!
//! Every failure surfaced by the engine is a [`GossError`]: a kind from a closed
//! taxonomy plus the operation and target it happened on, a human message, the
//! time it was raised, an optional wrapped cause and free-form details.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Transport could not be established or authenticated
    Connection,
    /// Remote command or session failure
    Execution,
    /// Deadline expired
    Timeout,
    /// Access denied, host key rejected
    Permission,
    /// Malformed input
    Validation,
    /// Transfer failed after exhausting retries
    Resource,
    /// Run configuration rejected
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Permission => "permission",
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Structured goss error
#[derive(Error, Debug)]
#[error(
    "{kind} error{}{}: {message}{}",
    in_operation(.operation),
    on_target(.target),
    cause_suffix(.source)
)]
pub struct GossError {
    pub kind: ErrorKind,
    pub operation: String,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[source]
    pub source: Option<BoxedCause>,
    pub details: BTreeMap<String, serde_json::Value>,
}

fn in_operation(operation: &str) -> String {
    if operation.is_empty() {
        String::new()
    } else {
        format!(" in {}", operation)
    }
}

fn on_target(target: &str) -> String {
    if target.is_empty() {
        String::new()
    } else {
        format!(" on {}", target)
    }
}

fn cause_suffix(source: &Option<BoxedCause>) -> String {
    match source {
        Some(cause) => format!(" (cause: {})", cause),
        None => String::new(),
    }
}

impl GossError {
    pub fn new(
        kind: ErrorKind,
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
            timestamp: Utc::now(),
            source: None,
            details: BTreeMap::new(),
        }
    }

    /// Attach the underlying cause
    pub fn with_source<E>(mut self, cause: E) -> Self
    where
        E: Into<BoxedCause>,
    {
        self.source = Some(cause.into());
        self
    }

    /// Add one context entry (port, timeout, attempt count...)
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Copy of this error without the (non-clonable) cause; the cause text is
    /// folded into the message instead.
    pub fn detached(&self) -> Self {
        let message = match &self.source {
            Some(cause) => format!("{} (cause: {})", self.message, cause),
            None => self.message.clone(),
        };
        Self {
            kind: self.kind,
            operation: self.operation.clone(),
            target: self.target.clone(),
            message,
            timestamp: self.timestamp,
            source: None,
            details: self.details.clone(),
        }
    }

    pub fn connection(operation: impl Into<String>, target: impl Into<String>, cause: impl Into<BoxedCause>) -> Self {
        Self::new(ErrorKind::Connection, operation, target, "connection failed").with_source(cause)
    }

    pub fn execution(operation: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, operation, target, message)
    }

    pub fn timeout(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, operation, target, "operation timed out")
    }

    pub fn permission(operation: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, operation, target, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "", "", message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, "", "", message)
    }

    pub fn resource(operation: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, operation, target, message)
    }
}

impl Serialize for GossError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("GossError", 8)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("operation", &self.operation)?;
        state.serialize_field("target", &self.target)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("cause", &self.source.as_ref().map(|c| c.to_string()))?;
        state.serialize_field("details", &self.details)?;
        state.serialize_field("error", &self.to_string())?;
        state.end()
    }
}

impl From<std::io::Error> for GossError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Resource,
        };
        Self::new(kind, "io", "", "I/O error").with_source(err)
    }
}

impl From<serde_yaml::Error> for GossError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration("YAML parse error").with_source(err)
    }
}

impl From<config::ConfigError> for GossError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration("failed to load goss configuration").with_source(err)
    }
}

/// Result type alias using GossError
pub type Result<T> = std::result::Result<T, GossError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_full() {
        let cause = std::io::Error::new(std::io::ErrorKind::Other, "broken pipe");
        let err = GossError::new(ErrorKind::Resource, "file_upload", "/tmp/a", "upload failed")
            .with_source(cause);
        assert_eq!(
            err.to_string(),
            "resource error in file_upload on /tmp/a: upload failed (cause: broken pipe)"
        );
    }

    #[test]
    fn test_display_without_operation_or_target() {
        let err = GossError::validation("description is mandatory");
        assert_eq!(err.to_string(), "validation error: description is mandatory");
    }

    #[test]
    fn test_details_and_kind() {
        let err = GossError::timeout("execute_command", "sleep 10")
            .with_detail("timeout_secs", 5)
            .with_detail("attempts", 1);
        assert!(err.is_kind(ErrorKind::Timeout));
        assert_eq!(err.details["timeout_secs"], serde_json::json!(5));
        assert_eq!(err.details.len(), 2);
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;
        let inner = GossError::permission("verify_host_key", "10.0.0.1", "key revoked");
        let outer = GossError::connection("ssh_connect", "10.0.0.1", inner);
        let source = outer.source().unwrap();
        assert!(source.to_string().contains("key revoked"));
    }

    #[test]
    fn test_detached_keeps_cause_text() {
        let err = GossError::connection(
            "ssh_connect",
            "10.0.0.1",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        )
        .with_detail("port", 22);
        let copy = err.detached();
        assert!(copy.source.is_none());
        assert!(copy.message.contains("refused"));
        assert_eq!(copy.details["port"], serde_json::json!(22));
    }

    #[test]
    fn test_io_error_mapping() {
        let err: GossError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind, ErrorKind::Permission);
        let err: GossError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind, ErrorKind::Resource);
    }

    #[test]
    fn test_serialize() {
        let err = GossError::validation("bad").with_detail("index", 3);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "validation");
        assert_eq!(value["details"]["index"], 3);
        assert_eq!(value["cause"], serde_json::Value::Null);
    }
}
