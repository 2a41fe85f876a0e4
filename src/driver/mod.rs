//! Native Driver Boundary
//!
//! This module defines the traits a database backend implements so the
//! execution engine can drive it. The engine never sees vendor types: every
//! backend returns positional rows of [`NativeValue`] aligned with a list of
//! [`ColumnDescriptor`]s, and every failure as a [`NativeError`].
//!
//! # Contract
//! - `NativeDriver::create_pool` opens a pool (and may warm connections)
//! - `NativePool::checkout` / `release` / `close` manage pooled connections
//! - `NativeConnection::execute` runs exactly one statement
//!
//! Any of these calls may fail at any point; callers classify the error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConnectionConfig;
use crate::mapper::ColumnDescriptor;
use crate::pool::PoolOptions;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Error raised by a native driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct NativeError {
    /// Driver message (may embed vendor codes such as `ORA-01017`)
    pub message: String,
    /// Vendor error code, when the driver exposes one separately
    pub code: Option<String>,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self { message: message.into(), code: Some(code.into()) }
    }
}

/// A single cell as returned by a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numeric rendered as decimal text
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    /// Structured value (JSON columns)
    Json(serde_json::Value),
}

/// Per-statement execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Stop fetching after this many rows
    pub max_rows: Option<usize>,
    /// Commit implicitly after the statement
    pub auto_commit: bool,
}

impl ExecuteOptions {
    /// Options for read paths: row cap, no transaction
    #[must_use]
    pub const fn read(max_rows: usize) -> Self {
        Self { max_rows: Some(max_rows), auto_commit: true }
    }

    /// Options for write paths: explicit commit/rollback required
    #[must_use]
    pub const fn write() -> Self {
        Self { max_rows: None, auto_commit: false }
    }
}

/// Raw statement result, already normalized to positional rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<NativeValue>>,
    pub rows_affected: Option<u64>,
}

/// A database backend capable of opening connection pools
#[async_trait]
pub trait NativeDriver: Send + Sync + 'static {
    type Pool: NativePool;

    /// Short backend name used in envelopes and logs
    fn name(&self) -> &'static str;

    /// Open a pool for the given connection parameters
    async fn create_pool(
        &self,
        config: &ConnectionConfig,
        options: &PoolOptions,
    ) -> Result<Self::Pool, NativeError>;
}

/// A native pool of reusable connections
///
/// Implementations must be internally synchronized.
#[async_trait]
pub trait NativePool: Send + Sync + 'static {
    type Connection: NativeConnection;

    async fn checkout(&self) -> Result<Self::Connection, NativeError>;

    /// Return a healthy connection to the pool
    async fn release(&self, conn: Self::Connection) -> Result<(), NativeError>;

    /// Close the pool without waiting for in-flight work
    async fn close(&self) -> Result<(), NativeError>;
}

/// A connection checked out of a [`NativePool`]
#[async_trait]
pub trait NativeConnection: Send + 'static {
    /// Execute a single statement with positional binds
    async fn execute(
        &mut self,
        sql: &str,
        binds: &[serde_json::Value],
        options: &ExecuteOptions,
    ) -> Result<RawResult, NativeError>;

    /// Trivial round trip used as a liveness probe
    async fn ping(&mut self) -> Result<(), NativeError>;

    async fn commit(&mut self) -> Result<(), NativeError>;

    async fn rollback(&mut self) -> Result<(), NativeError>;

    /// Produce the textual execution plan of a statement, one line per entry
    async fn explain_plan(&mut self, sql: &str) -> Result<Vec<String>, NativeError>;

    /// Discard the connection instead of returning it to the pool
    async fn close(self) -> Result<(), NativeError>
    where
        Self: Sized;
}
