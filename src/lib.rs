//! sqlwarden - Guarded Query Execution for AI Agents
//!
//! sqlwarden mediates caller-supplied SQL against a pooled relational database.
//! It enforces row ceilings, table whitelists and write-shape restrictions, and
//! returns uniform normalized results or classified errors regardless of what
//! the native driver produced.
//!
//! # Core Principles
//! - Validate before connecting: rejected statements never reach the database
//! - One classified error per failed operation, never a raw driver error
//! - Connections are released on every exit path
//! - Pattern-based checks are defense-in-depth; database grants remain the
//!   real security boundary
//!
//! # Module Organization
//! - [`policy`] - Table whitelist, row limits, DML verb/keyword policy
//! - [`sql`] - Read validation, pagination and point-in-time rewrites
//! - [`mapper`] - Type mapping and row normalization
//! - [`error`] - Error taxonomy and native error classification
//! - [`driver`] - Native driver traits (and the `PostgreSQL` backend)
//! - [`pool`] - Connection pool lifecycle and verified checkout
//! - [`engine`] - Operation orchestration
//! - [`plan`] - Heuristic execution plan analysis
//! - [`config`] - Configuration loading
//! - [`output`] - JSON output envelopes

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod output;
pub mod plan;
pub mod policy;
pub mod pool;
pub mod sql;

// Re-export commonly used types for convenience
pub use config::{load_config, ConnectionConfig, EngineConfig};
pub use driver::{ExecuteOptions, NativeConnection, NativeDriver, NativeError, NativePool, NativeValue, RawResult};
pub use engine::{
    operation_schemas, DmlOutcome, DmlRequest, Engine, ExplainOutcome, ExplainRequest, QueryOutcome, ReadQuery,
    TableScan,
};
pub use error::{classify, get_exit_class, ClassifiedError, ErrorKind, ExitClass, Result};
pub use mapper::{ColumnDescriptor, NormalizedRow, TargetType, TRUNCATION_MARKER};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use plan::{analyze_plan, PlanAnalysis, PlanWarning, Severity};
pub use policy::SecurityPolicy;
pub use pool::{PoolManager, PoolOptions, PoolStatus, PooledConnection};
