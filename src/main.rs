//! sqlwarden CLI Entry Point
//!
//! Subcommands:
//! - `query` - Run a read-only `SELECT`
//! - `scan` - Read a page of rows from one table
//! - `exec` - Run a single `INSERT` or `UPDATE`
//! - `explain` - Show and analyze an execution plan
//! - `check` - Validate SQL offline, without a database
//! - `schemas` - Print the JSON schema of every operation request
//!
//! All output to stdout is JSON-only. Logs go to stderr.
//! The process exit code is derived from the error class (0 on success).

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sqlwarden::config::{apply_policy_overrides, load_config};
use sqlwarden::driver::postgres::PostgresDriver;
use sqlwarden::engine::{operation_schemas, DmlRequest, Engine, ExplainRequest, ReadQuery, TableScan};
use sqlwarden::error::{ClassifiedError, ErrorKind, Result};
use sqlwarden::output::{write_output, ErrorEnvelope, Metadata, SuccessEnvelope};
use sqlwarden::policy::SecurityPolicy;
use sqlwarden::sql::{referenced_tables, validate_read_sql};

const DRIVER: &str = "postgres";

/// sqlwarden - guarded SQL execution for AI agents
#[derive(Parser)]
#[command(name = "sqlwarden")]
#[command(about = "Guarded query execution with row caps, table whitelists and DML guardrails")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.config/sqlwarden/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write the JSON envelope to a file instead of stdout
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Overwrite the --output file if it exists
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a read-only SELECT statement
    Query {
        #[arg(long)]
        sql: String,

        #[command(flatten)]
        page: PageArgs,

        /// Positional bind value (JSON; bare words are strings). Repeatable.
        #[arg(long = "bind")]
        binds: Vec<String>,
    },

    /// Read rows from one table
    Scan {
        #[arg(long)]
        table: String,

        #[command(flatten)]
        page: PageArgs,
    },

    /// Run a single INSERT or UPDATE statement
    Exec {
        #[arg(long)]
        sql: String,

        #[arg(long = "bind")]
        binds: Vec<String>,
    },

    /// Show the execution plan of a statement with performance warnings
    Explain {
        #[arg(long)]
        sql: String,
    },

    /// Validate a statement without connecting to a database
    Check {
        #[arg(long)]
        sql: String,

        /// Validate as INSERT/UPDATE instead of SELECT
        #[arg(long)]
        dml: bool,
    },

    /// Print the JSON schema of every operation request
    Schemas,
}

#[derive(Args)]
struct PageArgs {
    /// Maximum rows to return (clamped to the configured ceiling)
    #[arg(long, allow_negative_numbers = true)]
    limit: Option<i64>,

    /// Rows to skip
    #[arg(long)]
    offset: Option<u64>,

    /// Read as of an ISO-8601 timestamp
    #[arg(long)]
    as_of: Option<String>,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Scan { .. } => "scan",
            Self::Exec { .. } => "exec",
            Self::Explain { .. } => "explain",
            Self::Check { .. } => "check",
            Self::Schemas => "schemas",
        }
    }
}

#[derive(Serialize)]
struct CheckReport {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    verb: Option<String>,
    tables: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialize logging: {e}");
    }

    let cli = Cli::parse();
    let command = cli.command.name();

    let (json, code) = match run(&cli).await {
        Ok(json) => (json, 0),
        Err(err) => (error_json(command, &err), err.exit_class().code()),
    };

    let code = match emit(cli.output.as_deref(), &json, cli.force) {
        Ok(()) => code,
        Err(err) => {
            println!("{}", error_json(command, &err));
            err.exit_class().code()
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

const DEFAULT_LOG_FILTER: &str = "sqlwarden=info";

/// `RUST_LOG` when it is set and parses, `sqlwarden=info` otherwise
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the stderr subscriber; `LOG_FORMAT=json` switches to JSON lines
fn init_tracing() -> anyhow::Result<()> {
    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());
    let use_json = std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if use_json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
            .try_init()?;
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<String> {
    let command = cli.command.name();

    match &cli.command {
        Commands::Check { sql, dml } => {
            let mut policy = SecurityPolicy::default();
            apply_policy_overrides(&mut policy, |key| std::env::var(key).ok())?;
            let verb = if *dml { Some(policy.validate_dml_sql(sql)?) } else { validate_read_sql(sql).map(|()| None)? };
            let tables = referenced_tables(sql);
            for table in &tables {
                policy.check_table_access(table)?;
            }
            success(command, CheckReport { valid: true, verb, tables }, Metadata::new(0))
        }
        Commands::Schemas => success(command, operation_schemas(), Metadata::new(0)),
        _ => {
            let engine = connect(cli.config.as_deref()).await?;
            let result = run_with_engine(&engine, &cli.command).await;
            if let Err(e) = engine.close().await {
                warn!(error = %e, "failed to close connection pool");
            }
            result
        }
    }
}

async fn connect(config: Option<&Path>) -> Result<Engine<PostgresDriver>> {
    let config = load_config(config)?;
    Engine::connect(PostgresDriver, &config).await
}

async fn run_with_engine(engine: &Engine<PostgresDriver>, command: &Commands) -> Result<String> {
    let name = command.name();

    match command {
        Commands::Query { sql, page, binds } => {
            let request = ReadQuery {
                sql: sql.clone(),
                binds: parse_binds(binds),
                limit: page.limit,
                offset: page.offset,
                as_of: page.as_of.clone(),
            };
            let outcome = engine.read_query(request).await?;
            let meta = Metadata::with_rows(outcome.execution_time_ms, outcome.row_count);
            success(name, outcome, meta)
        }
        Commands::Scan { table, page } => {
            let request =
                TableScan { table: table.clone(), limit: page.limit, offset: page.offset, as_of: page.as_of.clone() };
            let outcome = engine.scan_table(request).await?;
            let meta = Metadata::with_rows(outcome.execution_time_ms, outcome.row_count);
            success(name, outcome, meta)
        }
        Commands::Exec { sql, binds } => {
            let outcome = engine.execute_dml(DmlRequest { sql: sql.clone(), binds: parse_binds(binds) }).await?;
            let meta = Metadata::new(outcome.execution_time_ms);
            success(name, outcome, meta)
        }
        Commands::Explain { sql } => {
            let outcome = engine.explain(ExplainRequest { sql: sql.clone() }).await?;
            let meta = Metadata::new(outcome.execution_time_ms);
            success(name, outcome, meta)
        }
        Commands::Check { .. } | Commands::Schemas => {
            Err(ClassifiedError::new(ErrorKind::Unknown, format!("'{name}' does not use a database connection")))
        }
    }
}

/// Bind arguments are JSON when they parse as JSON, strings otherwise
fn parse_binds(raw: &[String]) -> Vec<serde_json::Value> {
    raw.iter()
        .map(|b| serde_json::from_str(b).unwrap_or_else(|_| serde_json::Value::String(b.clone())))
        .collect()
}

fn success<T: Serialize>(command: &str, data: T, meta: Metadata) -> Result<String> {
    serde_json::to_string(&SuccessEnvelope::new(DRIVER, command, data, meta))
        .map_err(|e| ClassifiedError::new(ErrorKind::Unknown, format!("Failed to serialize result: {e}")))
}

fn error_json(command: &str, err: &ClassifiedError) -> String {
    serde_json::to_string(&ErrorEnvelope::from_error(DRIVER, command, err)).unwrap_or_else(|_| {
        format!(r#"{{"ok":false,"driver":"{DRIVER}","command":"{command}","error":{{"code":"UNKNOWN"}}}}"#)
    })
}

fn emit(path: Option<&Path>, json: &str, overwrite: bool) -> Result<()> {
    match path {
        Some(path) => write_output(path, json, overwrite),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_prefers_rust_log() {
        assert_eq!(log_filter(Some("sqlwarden=debug")).to_string(), "sqlwarden=debug");
        assert_eq!(log_filter(Some("warn")).to_string(), "warn");
    }

    #[test]
    fn test_log_filter_falls_back_to_default() {
        assert_eq!(log_filter(None).to_string(), DEFAULT_LOG_FILTER);
        assert_eq!(log_filter(Some("  ")).to_string(), DEFAULT_LOG_FILTER);
    }
}
