//! Error Handling Infrastructure
//!
//! This module defines the single terminal error type surfaced by sqlwarden,
//! [`ClassifiedError`], and the classifier that turns native driver failures
//! into it. Driver errors never leave the library unwrapped.
//!
//! # Error Kinds
//! Kinds are grouped by numeric range so an exit code can be derived from the
//! kind alone:
//! - `1000..2000` connection (unreachable host, authentication, timeout)
//! - `2000..3000` configuration (missing file, parse error, missing field)
//! - `3000..4000` query (not found, syntax, execution, access denied)
//! - `4000..5000` output (destination exists, permission denied)
//! - `9000` unknown

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::driver::NativeError;

/// Closed taxonomy of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum ErrorKind {
    /// Host unreachable, listener missing, connection dropped
    ConnectionFailed = 1000,
    /// Invalid username/password
    AuthenticationFailed = 1001,
    /// Connect or checkout timed out
    ConnectionTimeout = 1002,
    /// Pool is not initialized or already closed
    PoolUnavailable = 1003,

    /// Configuration file does not exist
    ConfigFileNotFound = 2000,
    /// Configuration file is not valid JSON or has the wrong shape
    ConfigParseError = 2001,
    /// A required configuration field is missing or empty
    ConfigMissingField = 2002,
    /// A configuration value is out of range or unparsable
    ConfigInvalidValue = 2003,

    /// Table, view or column does not exist
    ObjectNotFound = 3000,
    /// Rejected by a validator or by the database parser
    SyntaxError = 3001,
    /// Statement failed for any other reason
    ExecutionFailed = 3002,
    /// Blocked by the table whitelist or missing privileges
    AccessDenied = 3003,
    /// Unique, foreign key or not-null constraint violated
    ConstraintViolation = 3004,

    /// Output destination already exists
    OutputExists = 4000,
    /// Output destination is not writable
    OutputPermissionDenied = 4001,

    /// Anything not covered above
    Unknown = 9000,
}

impl ErrorKind {
    /// Stable error code string, suitable for programmatic handling by agents
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::PoolUnavailable => "POOL_UNAVAILABLE",
            Self::ConfigFileNotFound => "CONFIG_FILE_NOT_FOUND",
            Self::ConfigParseError => "CONFIG_PARSE_ERROR",
            Self::ConfigMissingField => "CONFIG_MISSING_FIELD",
            Self::ConfigInvalidValue => "CONFIG_INVALID_VALUE",
            Self::ObjectNotFound => "OBJECT_NOT_FOUND",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::OutputExists => "OUTPUT_EXISTS",
            Self::OutputPermissionDenied => "OUTPUT_PERMISSION_DENIED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Numeric code of this kind
    #[must_use]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Exit class derived purely from the numeric range of the kind
    #[must_use]
    pub const fn exit_class(&self) -> ExitClass {
        match self.code() {
            1000..=1999 => ExitClass::Connection,
            2000..=2999 => ExitClass::Configuration,
            3000..=3999 => ExitClass::Query,
            4000..=4999 => ExitClass::Output,
            _ => ExitClass::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitClass {
    Success,
    Unknown,
    Connection,
    Configuration,
    Query,
    Output,
}

impl ExitClass {
    /// Process exit code for this class
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Unknown => 1,
            Self::Connection => 2,
            Self::Configuration => 3,
            Self::Query => 4,
            Self::Output => 5,
        }
    }
}

/// Map an error kind to its process exit code
#[must_use]
pub const fn get_exit_class(kind: ErrorKind) -> i32 {
    kind.exit_class().code()
}

/// Terminal error type for every sqlwarden operation
///
/// Carries an agent-safe message, an optional remediation hint and the
/// native driver message for diagnostics. Never carries credentials.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ClassifiedError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
            native_code: None,
            native_message: None,
            details: BTreeMap::new(),
        }
    }

    /// Attach a remediation hint
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach a structured detail
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach the originating native error
    #[must_use]
    pub fn with_native(mut self, native: &NativeError) -> Self {
        self.native_code = native.code.clone();
        self.native_message = Some(native.message.clone());
        self
    }

    /// Stable error code string
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Human-readable message, without the kind prefix of `Display`
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exit class of this error
    #[must_use]
    pub const fn exit_class(&self) -> ExitClass {
        self.kind.exit_class()
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }

    pub fn connection_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionTimeout, message)
            .with_suggestion("Check network reachability or raise the pool queue timeout")
    }

    pub fn pool_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PoolUnavailable, message)
            .with_suggestion("Create the connection pool before issuing operations")
    }

    pub fn config(kind: ErrorKind, message: impl Into<String>) -> Self {
        debug_assert_eq!(kind.exit_class(), ExitClass::Configuration);
        Self::new(kind, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    pub fn output(kind: ErrorKind, message: impl Into<String>) -> Self {
        debug_assert_eq!(kind.exit_class(), ExitClass::Output);
        Self::new(kind, message)
    }
}

/// Result type alias for sqlwarden operations
pub type Result<T> = std::result::Result<T, ClassifiedError>;

/// A vendor error signature and what it classifies to
struct Signature {
    /// Substrings matched case-insensitively against the native message
    needles: &'static [&'static str],
    /// Exact native codes (ORA numbers or SQLSTATEs)
    codes: &'static [&'static str],
    kind: ErrorKind,
    message: &'static str,
    suggestion: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature {
        needles: &["ora-01017", "invalid username/password", "password authentication failed"],
        codes: &["ORA-01017", "28P01", "28000"],
        kind: ErrorKind::AuthenticationFailed,
        message: "Authentication failed: invalid username or password",
        suggestion: "Verify the configured user and password",
    },
    Signature {
        needles: &["ora-12170", "connect timeout", "timed out", "timeout expired"],
        codes: &["ORA-12170"],
        kind: ErrorKind::ConnectionTimeout,
        message: "Connection timed out",
        suggestion: "Check that the host is reachable and not blocked by a firewall",
    },
    Signature {
        needles: &["ora-12514", "listener does not currently know of service"],
        codes: &["ORA-12514", "3D000"],
        kind: ErrorKind::ConnectionFailed,
        message: "The requested service is unknown to the database listener",
        suggestion: "Verify the configured service name",
    },
    Signature {
        needles: &["ora-12541", "no listener", "connection refused", "error connecting to server"],
        codes: &["ORA-12541"],
        kind: ErrorKind::ConnectionFailed,
        message: "No database listener at the configured host and port",
        suggestion: "Verify host and port, and that the database is running",
    },
    Signature {
        needles: &["ora-03113", "ora-03114", "not connected", "connection closed", "terminating connection"],
        codes: &["ORA-03113", "ORA-03114", "57P01", "08000", "08003", "08006"],
        kind: ErrorKind::ConnectionFailed,
        message: "The database connection was lost",
        suggestion: "Retry the operation; the pool will reconnect",
    },
    Signature {
        needles: &["ora-00942", "table or view does not exist"],
        codes: &["ORA-00942", "42P01"],
        kind: ErrorKind::ObjectNotFound,
        message: "Table or view does not exist",
        suggestion: "Check the object name and schema, or list tables first",
    },
    Signature {
        needles: &["ora-00904", "invalid identifier"],
        codes: &["ORA-00904", "42703"],
        kind: ErrorKind::ObjectNotFound,
        message: "Invalid identifier: a referenced column does not exist",
        suggestion: "Check column names against the table definition",
    },
    Signature {
        needles: &["ora-00001", "unique constraint", "duplicate key value"],
        codes: &["ORA-00001", "23505"],
        kind: ErrorKind::ConstraintViolation,
        message: "Unique constraint violated",
        suggestion: "A row with the same key already exists",
    },
    Signature {
        needles: &["ora-02291", "parent key not found", "violates foreign key constraint"],
        codes: &["ORA-02291", "23503"],
        kind: ErrorKind::ConstraintViolation,
        message: "Integrity constraint violated: parent key not found",
        suggestion: "Insert the referenced parent row first",
    },
    Signature {
        needles: &["ora-01400", "cannot insert null", "not null constraint", "violates not-null constraint"],
        codes: &["ORA-01400", "23502"],
        kind: ErrorKind::ConstraintViolation,
        message: "Not null constraint violated",
        suggestion: "Provide values for all mandatory columns",
    },
    Signature {
        needles: &["ora-01031", "insufficient privileges", "permission denied"],
        codes: &["ORA-01031", "42501"],
        kind: ErrorKind::AccessDenied,
        message: "Insufficient privileges for this operation",
        suggestion: "Ask a DBA for the required grant",
    },
    Signature {
        needles: &["ora-00900", "ora-00933", "ora-00936", "syntax error", "invalid sql statement"],
        codes: &["ORA-00900", "ORA-00933", "ORA-00936", "42601"],
        kind: ErrorKind::SyntaxError,
        message: "The database rejected the statement syntax",
        suggestion: "Check the SQL for typos or dialect-specific syntax",
    },
];

/// Classify a native driver error into the closed taxonomy
///
/// Matches the native code first, then known message signatures. Falls back
/// to [`ErrorKind::ExecutionFailed`] when nothing matches.
#[must_use]
pub fn classify(native: &NativeError) -> ClassifiedError {
    let lowered = native.message.to_lowercase();
    let code = native.code.as_deref();

    let matched = SIGNATURES
        .iter()
        .find(|sig| code.is_some_and(|c| sig.codes.contains(&c)))
        .or_else(|| SIGNATURES.iter().find(|sig| sig.needles.iter().any(|n| lowered.contains(n))));

    match matched {
        Some(sig) => ClassifiedError::new(sig.kind, sig.message)
            .with_suggestion(sig.suggestion)
            .with_native(native),
        None => ClassifiedError::execution_failed(format!("Statement failed: {}", native.message))
            .with_native(native),
    }
}

/// Classify a failure that happened while acquiring or probing a connection
///
/// Anything that does not already classify as connection-class becomes
/// [`ErrorKind::ConnectionFailed`].
#[must_use]
pub fn classify_connection(native: &NativeError) -> ClassifiedError {
    let classified = classify(native);
    if classified.exit_class() == ExitClass::Connection {
        return classified;
    }
    ClassifiedError::connection_failed(format!("Could not obtain a usable connection: {}", native.message))
        .with_native(native)
}
