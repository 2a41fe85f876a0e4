//! Execution Engine
//!
//! Orchestrates one logical operation end to end:
//! validate → rewrite → check out a connection → execute → normalize → release.
//!
//! # Operations
//! - [`Engine::read_query`] - caller-supplied `SELECT`, optionally paginated and point-in-time
//! - [`Engine::scan_table`] - paginated `SELECT *` over one whitelisted table
//! - [`Engine::execute_dml`] - single `INSERT`/`UPDATE` with explicit commit or rollback
//! - [`Engine::explain`] - execution plan plus heuristic analysis
//!
//! # Guarantees
//! - Validation failures are reported before any connection is checked out
//! - A checked-out connection is released on every exit path
//! - Every error leaving the engine is a [`ClassifiedError`](crate::error::ClassifiedError)
//! - Read paths never open transactions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::driver::{ExecuteOptions, NativeConnection, NativeDriver, RawResult};
use crate::error::{classify, Result};
use crate::mapper::{map_rows, NormalizedRow};
use crate::plan::{analyze_plan, PlanAnalysis};
use crate::policy::SecurityPolicy;
use crate::pool::PoolManager;
use crate::sql::{
    build_paginated_sql, build_point_in_time_sql, referenced_tables, validate_identifier, validate_read_sql,
};

/// Run a caller-supplied `SELECT`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadQuery {
    /// `SELECT` statement; positional bind placeholders are allowed
    pub sql: String,

    /// Positional bind values
    #[serde(default)]
    pub binds: Vec<serde_json::Value>,

    /// Requested row limit, clamped to the configured ceiling
    #[serde(default)]
    pub limit: Option<i64>,

    /// Rows to skip
    #[serde(default)]
    pub offset: Option<u64>,

    /// ISO-8601 timestamp for a point-in-time read
    #[serde(default)]
    pub as_of: Option<String>,
}

/// Read rows from a single table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TableScan {
    /// Table name, optionally schema-qualified
    pub table: String,

    #[serde(default)]
    pub limit: Option<i64>,

    #[serde(default)]
    pub offset: Option<u64>,

    /// ISO-8601 timestamp for a point-in-time read
    #[serde(default)]
    pub as_of: Option<String>,
}

/// Run a single `INSERT` or `UPDATE`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DmlRequest {
    pub sql: String,

    #[serde(default)]
    pub binds: Vec<serde_json::Value>,
}

/// Explain a read or DML statement without running it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExplainRequest {
    pub sql: String,
}

/// Normalized result of a read operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub rows: Vec<NormalizedRow>,
    pub row_count: usize,
    pub column_names: Vec<String>,
    pub execution_time_ms: u64,
    /// SQL actually sent to the database
    pub effective_sql: String,
    /// The effective row limit was reached; more rows may exist
    pub truncated: bool,
}

/// Result of a DML operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmlOutcome {
    pub verb: String,
    pub rows_affected: u64,
    pub execution_time_ms: u64,
    pub effective_sql: String,
}

/// Result of an explain operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainOutcome {
    pub plan_lines: Vec<String>,
    pub analysis: PlanAnalysis,
    pub execution_time_ms: u64,
    pub effective_sql: String,
}

/// JSON schema of every operation request, keyed by operation name
#[must_use]
pub fn operation_schemas() -> BTreeMap<&'static str, serde_json::Value> {
    let mut schemas = BTreeMap::new();
    for (name, schema) in [
        ("read_query", schemars::schema_for!(ReadQuery)),
        ("scan_table", schemars::schema_for!(TableScan)),
        ("execute_dml", schemars::schema_for!(DmlRequest)),
        ("explain", schemars::schema_for!(ExplainRequest)),
    ] {
        schemas.insert(name, serde_json::to_value(schema).unwrap_or_default());
    }
    schemas
}

/// The query execution engine
///
/// Holds an explicit pool handle and the security policy; stateless between
/// calls otherwise. Cheap to share behind an `Arc`.
pub struct Engine<D: NativeDriver> {
    pool: Arc<PoolManager<D>>,
    policy: SecurityPolicy,
}

impl<D: NativeDriver> Engine<D> {
    pub const fn new(pool: Arc<PoolManager<D>>, policy: SecurityPolicy) -> Self {
        Self { pool, policy }
    }

    /// Create the pool described by `config` and wrap it in an engine
    pub async fn connect(driver: D, config: &EngineConfig) -> Result<Self> {
        let pool = PoolManager::new(driver, config.pool.clone());
        pool.create_pool(&config.connection).await?;
        Ok(Self::new(Arc::new(pool), config.security.clone()))
    }

    pub const fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &PoolManager<D> {
        &self.pool
    }

    /// Close the underlying pool
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }

    /// Run a caller-supplied `SELECT`
    ///
    /// The statement is capped at the effective row limit by the driver and
    /// rewritten with a pagination clause only when an offset is requested.
    pub async fn read_query(&self, request: ReadQuery) -> Result<QueryOutcome> {
        let start = Instant::now();

        validate_read_sql(&request.sql)?;
        self.check_referenced_tables(&request.sql)?;

        let limit = self.policy.enforce_row_limit(request.limit);
        let sql = build_point_in_time_sql(&request.sql, request.as_of.as_deref())?;
        let sql = match request.offset.filter(|o| *o > 0) {
            Some(offset) => build_paginated_sql(&sql, Some(limit as u64), Some(offset)),
            None => build_paginated_sql(&sql, None, None),
        };

        let raw = self.run_read(&sql, &request.binds, limit).await?;
        let outcome = self.normalize(raw, limit, sql, start);
        debug!(
            operation = "read_query",
            rows = outcome.row_count,
            truncated = outcome.truncated,
            elapsed_ms = outcome.execution_time_ms,
            "operation complete"
        );
        Ok(outcome)
    }

    /// Read a page of rows from one table
    pub async fn scan_table(&self, request: TableScan) -> Result<QueryOutcome> {
        let start = Instant::now();

        validate_identifier(&request.table)?;
        self.policy.check_table_access(&request.table)?;

        let limit = self.policy.enforce_row_limit(request.limit);
        let base = format!("SELECT * FROM {}", request.table.trim());
        let sql = build_point_in_time_sql(&base, request.as_of.as_deref())?;
        let sql = build_paginated_sql(&sql, Some(limit as u64), request.offset);

        let raw = self.run_read(&sql, &[], limit).await?;
        let outcome = self.normalize(raw, limit, sql, start);
        debug!(
            operation = "scan_table",
            table = %request.table,
            rows = outcome.row_count,
            elapsed_ms = outcome.execution_time_ms,
            "operation complete"
        );
        Ok(outcome)
    }

    /// Run one `INSERT` or `UPDATE` in its own transaction
    ///
    /// Commits on success. On any execution or commit failure the statement
    /// is rolled back; rollback failures are logged and the original error is
    /// returned.
    pub async fn execute_dml(&self, request: DmlRequest) -> Result<DmlOutcome> {
        let start = Instant::now();

        let verb = self.policy.validate_dml_sql(&request.sql)?;
        self.check_referenced_tables(&request.sql)?;

        let sql = request.sql.trim().to_string();
        let mut pooled = self.pool.get_connection().await?;
        let result = run_in_transaction(pooled.native(), &sql, &request.binds).await;
        self.pool.release_connection(pooled).await;
        let raw = result?;

        let outcome = DmlOutcome {
            verb,
            rows_affected: raw.rows_affected.unwrap_or(0),
            execution_time_ms: elapsed_ms(start),
            effective_sql: sql,
        };
        debug!(
            operation = "execute_dml",
            verb = %outcome.verb,
            rows_affected = outcome.rows_affected,
            elapsed_ms = outcome.execution_time_ms,
            "operation complete"
        );
        Ok(outcome)
    }

    /// Fetch and analyze the execution plan of a statement
    ///
    /// Accepts anything the read validator or the DML validator accepts.
    pub async fn explain(&self, request: ExplainRequest) -> Result<ExplainOutcome> {
        let start = Instant::now();

        if let Err(read_err) = validate_read_sql(&request.sql) {
            if self.policy.validate_dml_sql(&request.sql).is_err() {
                return Err(read_err);
            }
        }
        self.check_referenced_tables(&request.sql)?;

        let sql = build_paginated_sql(&request.sql, None, None);
        let mut pooled = self.pool.get_connection().await?;
        let result = pooled.native().explain_plan(&sql).await;
        self.pool.release_connection(pooled).await;
        let plan_lines = result.map_err(|e| classify(&e))?;

        let analysis = analyze_plan(&plan_lines);
        debug!(
            operation = "explain",
            warnings = analysis.warnings.len(),
            elapsed_ms = elapsed_ms(start),
            "operation complete"
        );
        Ok(ExplainOutcome { plan_lines, analysis, execution_time_ms: elapsed_ms(start), effective_sql: sql })
    }

    fn check_referenced_tables(&self, sql: &str) -> Result<()> {
        referenced_tables(sql).iter().try_for_each(|table| self.policy.check_table_access(table))
    }

    async fn run_read(&self, sql: &str, binds: &[serde_json::Value], limit: usize) -> Result<RawResult> {
        let mut pooled = self.pool.get_connection().await?;
        let result = pooled.native().execute(sql, binds, &ExecuteOptions::read(limit)).await;
        self.pool.release_connection(pooled).await;
        result.map_err(|e| classify(&e))
    }

    fn normalize(&self, raw: RawResult, limit: usize, effective_sql: String, start: Instant) -> QueryOutcome {
        let RawResult { columns, mut rows, .. } = raw;
        rows.truncate(limit);
        let truncated = rows.len() >= limit;

        let rows = map_rows(&columns, rows, &self.policy.mapper_limits());
        QueryOutcome {
            row_count: rows.len(),
            column_names: columns.into_iter().map(|c| c.name).collect(),
            rows,
            execution_time_ms: elapsed_ms(start),
            effective_sql,
            truncated,
        }
    }
}

/// Execute, then commit; roll back on any failure
async fn run_in_transaction<C: NativeConnection>(
    conn: &mut C,
    sql: &str,
    binds: &[serde_json::Value],
) -> Result<RawResult> {
    let failure = match conn.execute(sql, binds, &ExecuteOptions::write()).await {
        Ok(raw) => match conn.commit().await {
            Ok(()) => return Ok(raw),
            Err(e) => e,
        },
        Err(e) => e,
    };

    if let Err(rollback_err) = conn.rollback().await {
        warn!(error = %rollback_err, "rollback failed after statement error");
    }
    Err(classify(&failure))
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
