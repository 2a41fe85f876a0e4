//! JSON Output Envelope Types
//!
//! This module defines the structured JSON output format for all sqlwarden operations.
//! All operations return either a `SuccessEnvelope` or an `ErrorEnvelope`.
//!
//! # Output Contract
//! - Success: `{"ok": true, "driver": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "driver": "...", "command": "...", "error": {"code": "...", "message": "...", ...}}`
//!
//! Output is stable and suitable for programmatic parsing by agents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{ClassifiedError, ErrorKind, Result};

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Database driver used for this operation
    pub driver: String,

    /// Command that was executed (query, scan, exec, explain, check)
    pub command: String,

    /// Operation-specific data
    pub data: T,

    /// Execution metadata
    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(driver: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, driver: driver.into(), command: command.into(), data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Database driver (empty when the failure happened before connecting)
    pub driver: String,

    /// Command that was attempted
    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(driver: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, driver: driver.into(), command: command.into(), error }
    }

    /// Create error envelope from a `ClassifiedError`
    pub fn from_error(driver: impl Into<String>, command: impl Into<String>, err: &ClassifiedError) -> Self {
        Self::new(driver, command, ErrorInfo::from(err))
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "ACCESS_DENIED", "CONNECTION_FAILED")
    pub code: String,

    /// Numeric kind; its range identifies the error class
    pub kind: u16,

    /// Human-readable error message (agent-appropriate, no sensitive data)
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_message: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,

    /// Process exit code for this error
    pub exit_code: i32,
}

impl From<&ClassifiedError> for ErrorInfo {
    fn from(err: &ClassifiedError) -> Self {
        Self {
            code: err.error_code().to_string(),
            kind: err.kind.code(),
            message: err.message().to_string(),
            suggestion: err.suggestion.clone(),
            native_code: err.native_code.clone(),
            native_message: err.native_message.clone(),
            details: err.details.clone(),
            exit_code: err.exit_class().code(),
        }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Execution time in milliseconds
    pub execution_ms: u64,

    /// Number of rows returned (for query results, None for other operations)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}

/// Write `contents` to `path`
///
/// Refuses to replace an existing file unless `overwrite` is set.
pub fn write_output(path: &Path, contents: &str, overwrite: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    let mut file = options.open(path).map_err(|e| output_error(path, &e))?;
    file.write_all(contents.as_bytes()).map_err(|e| output_error(path, &e))?;
    file.flush().map_err(|e| output_error(path, &e))
}

fn output_error(path: &Path, e: &std::io::Error) -> ClassifiedError {
    match e.kind() {
        std::io::ErrorKind::AlreadyExists => {
            ClassifiedError::output(ErrorKind::OutputExists, format!("Output file already exists: {}", path.display()))
                .with_suggestion("Pass --force to overwrite it")
        }
        std::io::ErrorKind::PermissionDenied => ClassifiedError::output(
            ErrorKind::OutputPermissionDenied,
            format!("Permission denied writing output file {}", path.display()),
        )
        .with_suggestion("Choose a writable location or fix the file permissions"),
        std::io::ErrorKind::NotFound => {
            let parent = path.parent().unwrap_or(path);
            ClassifiedError::output(
                ErrorKind::OutputPermissionDenied,
                format!("Output directory does not exist: {}", parent.display()),
            )
            .with_suggestion("Create the directory first or choose another output path")
        }
        // the output class has no closer kind for other write failures
        _ => ClassifiedError::output(
            ErrorKind::OutputPermissionDenied,
            format!("Cannot write output file {}: {e}", path.display()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_serialization() {
        let envelope = SuccessEnvelope::new(
            "postgres",
            "query",
            serde_json::json!({"result": "test"}),
            Metadata::with_rows(42, 10),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""ok":true"#));
        assert!(json.contains(r#""driver":"postgres"#));
        assert!(json.contains(r#""command":"query"#));
        assert!(json.contains(r#""execution_ms":42"#));
        assert!(json.contains(r#""rows_returned":10"#));
    }

    #[test]
    fn test_error_envelope_from_classified_error() {
        let err = ClassifiedError::access_denied("Access to table 'ORDERS' is denied. Allowed tables: EMPLOYEES");
        let envelope = ErrorEnvelope::from_error("postgres", "scan", &err);

        assert!(!envelope.ok);
        assert_eq!(envelope.error.code, "ACCESS_DENIED");
        assert_eq!(envelope.error.kind, 3003);
        assert_eq!(envelope.error.exit_code, 4);
        assert!(envelope.error.message.contains("ORDERS"));
    }

    #[test]
    fn test_metadata_without_rows() {
        let json = serde_json::to_string(&Metadata::new(100)).unwrap();
        assert!(json.contains(r#""execution_ms":100"#));
        assert!(!json.contains("rows_returned"));
    }

    #[test]
    fn test_write_output_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");

        write_output(&path, "{}", false).unwrap();
        let err = write_output(&path, "{\"a\":1}", false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutputExists);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");

        write_output(&path, "{\"a\":1}", true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_write_output_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_output(&dir.path().join("missing/out.json"), "{}", false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutputPermissionDenied);
        assert_eq!(err.exit_class().code(), 5);
        assert!(err.message.starts_with("Output directory does not exist"), "{}", err.message);
        assert!(err.message.ends_with("missing"), "{}", err.message);
        assert!(!err.message.contains("ermission"));
    }

    #[test]
    fn test_output_error_names_the_cause() {
        let path = Path::new("/var/reports/out.json");

        let denied = output_error(path, &std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind, ErrorKind::OutputPermissionDenied);
        assert_eq!(denied.message, "Permission denied writing output file /var/reports/out.json");

        let missing = output_error(path, &std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.message, "Output directory does not exist: /var/reports");

        let full = output_error(path, &std::io::Error::other("No space left on device"));
        assert!(full.message.contains("No space left on device"));
        assert_eq!(full.exit_class().code(), 5);
    }
}
