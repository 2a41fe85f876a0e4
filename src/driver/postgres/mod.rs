//! `PostgreSQL` Driver Implementation
//!
//! This module implements the native driver traits for `PostgreSQL`.
//!
//! # Features
//! - Client-server connections via TCP, pooled by `deadpool-postgres`
//! - Positional binds converted against the prepared statement's parameter types
//! - Rich type support (JSON/JSONB, timestamps, NUMERIC, BYTEA, UUID)
//! - `EXPLAIN` plans returned line by line
//!
//! # Implementation Notes
//! - `service_name` is used as the database name
//! - `min` connections are opened at pool creation, which also validates credentials
//! - `increment` is advisory; `ping_interval_secs` becomes the TCP keepalive
//!   idle time so idle pooled connections are checked by the OS, while the
//!   pool manager still probes every checkout
//! - Write statements open an explicit transaction (`BEGIN`) that stays open
//!   until `commit` or `rollback`
//! - NUMERIC is decoded from and encoded to the binary wire format directly
//! - Rows are streamed and fetching stops at the row cap

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
};
use futures_util::{pin_mut, TryStreamExt};
use std::error::Error as StdError;
use std::fmt::Write as _;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{NoTls, Row};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::driver::{
    ExecuteOptions, NativeConnection, NativeDriver, NativeError, NativePool, NativeValue, RawResult,
};
use crate::mapper::ColumnDescriptor;
use crate::pool::PoolOptions;

type BoxError = Box<dyn StdError + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// `PostgreSQL` driver
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

/// Pool of `PostgreSQL` connections
pub struct PostgresPool {
    pool: Pool,
}

/// A pooled `PostgreSQL` connection
pub struct PostgresConnection {
    client: Object,
    in_transaction: bool,
}

#[async_trait]
impl NativeDriver for PostgresDriver {
    type Pool = PostgresPool;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn create_pool(
        &self,
        config: &ConnectionConfig,
        options: &PoolOptions,
    ) -> Result<PostgresPool, NativeError> {
        let pool = build_pg_config(config, options)
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| NativeError::new(format!("Failed to create pool: {e}")))?;

        // Warm the minimum number of connections; the first one validates credentials
        let mut warm = Vec::with_capacity(options.min as usize);
        for _ in 0..options.min {
            match pool.get().await {
                Ok(conn) => warm.push(conn),
                Err(e) => {
                    pool.close();
                    return Err(native_from_pool(e));
                }
            }
        }
        debug!(warmed = warm.len(), "postgres pool warmed");
        drop(warm);

        Ok(PostgresPool { pool })
    }
}

#[async_trait]
impl NativePool for PostgresPool {
    type Connection = PostgresConnection;

    async fn checkout(&self) -> Result<PostgresConnection, NativeError> {
        let client = self.pool.get().await.map_err(native_from_pool)?;
        Ok(PostgresConnection { client, in_transaction: false })
    }

    async fn release(&self, mut conn: PostgresConnection) -> Result<(), NativeError> {
        // Never hand an open transaction to the next caller
        if conn.in_transaction {
            if let Err(e) = conn.rollback().await {
                let _ = Object::take(conn.client);
                return Err(e);
            }
        }
        drop(conn);
        Ok(())
    }

    async fn close(&self) -> Result<(), NativeError> {
        self.pool.close();
        Ok(())
    }
}

#[async_trait]
impl NativeConnection for PostgresConnection {
    async fn execute(
        &mut self,
        sql: &str,
        binds: &[serde_json::Value],
        options: &ExecuteOptions,
    ) -> Result<RawResult, NativeError> {
        if !options.auto_commit && !self.in_transaction {
            self.client.batch_execute("BEGIN").await.map_err(|e| native_from_pg(&e))?;
            self.in_transaction = true;
        }

        let stmt = self.client.prepare(sql).await.map_err(|e| native_from_pg(&e))?;

        if stmt.params().len() != binds.len() {
            return Err(NativeError::new(format!(
                "Statement expects {} bind values, got {}",
                stmt.params().len(),
                binds.len()
            )));
        }

        let params = binds
            .iter()
            .zip(stmt.params())
            .map(|(value, ty)| bind_param(value, ty))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| &**p as &(dyn ToSql + Sync)).collect();

        // Statements without result columns (INSERT, UPDATE, ...) report rows affected
        if stmt.columns().is_empty() {
            let rows_affected = self.client.execute(&stmt, &refs).await.map_err(|e| native_from_pg(&e))?;
            return Ok(RawResult { columns: Vec::new(), rows: Vec::new(), rows_affected: Some(rows_affected) });
        }

        let columns: Vec<ColumnDescriptor> = stmt
            .columns()
            .iter()
            .map(|c| ColumnDescriptor::new(c.name(), c.type_().name().to_uppercase()))
            .collect();

        let stream = self.client.query_raw(&stmt, refs.iter().copied()).await.map_err(|e| native_from_pg(&e))?;
        pin_mut!(stream);
        let cap = options.max_rows.unwrap_or(usize::MAX);

        let mut values = Vec::new();
        while values.len() < cap {
            match stream.try_next().await.map_err(|e| native_from_pg(&e))? {
                Some(row) => values.push(row_to_values(&row)?),
                None => break,
            }
        }

        Ok(RawResult { columns, rows: values, rows_affected: None })
    }

    async fn ping(&mut self) -> Result<(), NativeError> {
        self.client.batch_execute("SELECT 1").await.map_err(|e| native_from_pg(&e))
    }

    async fn commit(&mut self) -> Result<(), NativeError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute("COMMIT").await.map_err(|e| native_from_pg(&e))
    }

    async fn rollback(&mut self) -> Result<(), NativeError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.client.batch_execute("ROLLBACK").await.map_err(|e| native_from_pg(&e))
    }

    async fn explain_plan(&mut self, sql: &str) -> Result<Vec<String>, NativeError> {
        let rows = self
            .client
            .query(format!("EXPLAIN {sql}").as_str(), &[])
            .await
            .map_err(|e| native_from_pg(&e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map_err(|e| NativeError::new(format!("Failed to read plan line: {e}")))
            })
            .collect()
    }

    async fn close(self) -> Result<(), NativeError> {
        // Detach from the pool so the connection is dropped instead of recycled
        drop(Object::take(self.client));
        Ok(())
    }
}

/// Build the deadpool configuration from connection and pool settings
fn build_pg_config(config: &ConnectionConfig, options: &PoolOptions) -> Config {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.service_name.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = config.password.clone();
    cfg.connect_timeout = Some(options.queue_timeout());
    cfg.manager = Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });
    if options.ping_interval_secs > 0 {
        cfg.keepalives = Some(true);
        cfg.keepalives_idle = Some(options.ping_interval());
    }

    let mut pool = PoolConfig::new(options.max.max(1) as usize);
    pool.timeouts.wait = Some(options.queue_timeout());
    pool.timeouts.create = Some(options.queue_timeout());
    cfg.pool = Some(pool);

    cfg
}

/// Convert a driver error, keeping the SQLSTATE when the server sent one
fn native_from_pg(e: &tokio_postgres::Error) -> NativeError {
    match e.as_db_error() {
        Some(db) => NativeError::with_code(db.message(), db.code().code()),
        None => match e.source() {
            Some(source) => NativeError::new(format!("{e}: {source}")),
            None => NativeError::new(e.to_string()),
        },
    }
}

fn native_from_pool(e: PoolError) -> NativeError {
    match e {
        PoolError::Backend(pg) => native_from_pg(&pg),
        PoolError::Timeout(kind) => NativeError::new(format!("connect timeout ({kind:?}) waiting for a connection")),
        other => NativeError::new(other.to_string()),
    }
}

/// Convert a `PostgreSQL` row into positional native values
fn row_to_values(row: &Row) -> Result<Vec<NativeValue>, NativeError> {
    (0..row.len()).map(|idx| postgres_value(row, idx)).collect()
}

/// Convert one `PostgreSQL` cell
fn postgres_value(row: &Row, idx: usize) -> Result<NativeValue, NativeError> {
    let col_type = row.columns()[idx].type_().clone();

    match col_type {
        Type::BOOL => cell(row, idx, NativeValue::Bool),

        Type::INT2 => cell(row, idx, |v: i16| NativeValue::Int(i64::from(v))),
        Type::INT4 => cell(row, idx, |v: i32| NativeValue::Int(i64::from(v))),
        Type::INT8 => cell(row, idx, NativeValue::Int),
        Type::OID => cell(row, idx, |v: u32| NativeValue::Int(i64::from(v))),

        Type::FLOAT4 => cell(row, idx, |v: f32| NativeValue::Float(f64::from(v))),
        Type::FLOAT8 => cell(row, idx, NativeValue::Float),
        Type::NUMERIC => cell(row, idx, |v: PgNumeric| NativeValue::Decimal(v.0)),

        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            cell(row, idx, NativeValue::Text)
        }

        Type::JSON | Type::JSONB => cell(row, idx, NativeValue::Json),

        Type::BYTEA => cell(row, idx, NativeValue::Bytes),

        Type::TIMESTAMP => cell(row, idx, |v: NaiveDateTime| NativeValue::Timestamp(v.and_utc())),
        Type::TIMESTAMPTZ => cell(row, idx, |v: DateTime<Utc>| NativeValue::Timestamp(v)),
        Type::DATE => cell(row, idx, |v: NaiveDate| {
            NativeValue::Timestamp(v.and_time(NaiveTime::MIN).and_utc())
        }),
        Type::TIME => cell(row, idx, |v: NaiveTime| NativeValue::Text(v.format("%H:%M:%S%.f").to_string())),

        Type::UUID => cell(row, idx, |v: uuid::Uuid| NativeValue::Text(v.to_string())),

        // Anything else must at least come back as text
        _ => row.try_get::<_, Option<String>>(idx).map(|v| v.map_or(NativeValue::Null, NativeValue::Text)).map_err(
            |e| NativeError::new(format!("Failed to convert PostgreSQL type '{}': {e}", col_type.name())),
        ),
    }
}

fn cell<'a, T, F>(row: &'a Row, idx: usize, convert: F) -> Result<NativeValue, NativeError>
where
    T: FromSql<'a>,
    F: FnOnce(T) -> NativeValue,
{
    let value: Option<T> = row.try_get(idx).map_err(|e| {
        NativeError::new(format!("Failed to read column '{}': {e}", row.columns()[idx].name()))
    })?;
    Ok(value.map_or(NativeValue::Null, convert))
}

/// Convert a JSON bind value to the parameter type the server expects
fn bind_param(value: &serde_json::Value, ty: &Type) -> Result<Box<dyn ToSql + Sync + Send>, NativeError> {
    use crate::sql::parse_timestamp;

    let param: Box<dyn ToSql + Sync + Send> = match *ty {
        Type::BOOL => Box::new(convert(value, ty, serde_json::Value::as_bool)?),
        Type::INT2 => Box::new(convert(value, ty, |v| v.as_i64().and_then(|n| i16::try_from(n).ok()))?),
        Type::INT4 => Box::new(convert(value, ty, |v| v.as_i64().and_then(|n| i32::try_from(n).ok()))?),
        Type::INT8 => Box::new(convert(value, ty, serde_json::Value::as_i64)?),
        #[allow(clippy::cast_possible_truncation)]
        Type::FLOAT4 => Box::new(convert(value, ty, |v| v.as_f64().map(|f| f as f32))?),
        Type::FLOAT8 => Box::new(convert(value, ty, serde_json::Value::as_f64)?),
        Type::NUMERIC => Box::new(convert(value, ty, |v| match v {
            serde_json::Value::Number(n) => Some(PgNumeric(n.to_string())),
            serde_json::Value::String(s) => Some(PgNumeric(s.clone())),
            _ => None,
        })?),
        Type::JSON | Type::JSONB => Box::new(convert(value, ty, |v| Some(v.clone()))?),
        Type::TIMESTAMPTZ => Box::new(convert(value, ty, |v| {
            v.as_str().and_then(|s| parse_timestamp(s).ok()).map(|ts| ts.and_utc())
        })?),
        Type::TIMESTAMP => Box::new(convert(value, ty, |v| v.as_str().and_then(|s| parse_timestamp(s).ok()))?),
        Type::DATE => Box::new(convert(value, ty, |v| {
            v.as_str().and_then(|s| parse_timestamp(s).ok()).map(|ts| ts.date())
        })?),
        Type::BYTEA => Box::new(convert(value, ty, |v| {
            use base64::Engine;
            v.as_str().and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
        })?),
        Type::UUID => Box::new(convert(value, ty, |v| v.as_str().and_then(|s| uuid::Uuid::parse_str(s).ok()))?),
        _ => Box::new(convert(value, ty, |v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })?),
    };

    Ok(param)
}

fn convert<T>(
    value: &serde_json::Value,
    ty: &Type,
    f: impl FnOnce(&serde_json::Value) -> Option<T>,
) -> Result<Option<T>, NativeError> {
    if value.is_null() {
        return Ok(None);
    }
    f(value)
        .map(Some)
        .ok_or_else(|| NativeError::new(format!("Cannot bind value {value} as {}", ty.name())))
}

/// NUMERIC rendered as decimal text
#[derive(Debug, Clone, PartialEq, Eq)]
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

impl ToSql for PgNumeric {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        encode_numeric(&self.0, out)?;
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }

    to_sql_checked!();
}

/// Decode the binary NUMERIC format: header of ndigits, weight, sign and
/// dscale, then base-10000 digits
fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    if buf.remaining() < 8 {
        return Err("numeric value too short".into());
    }
    let ndigits = usize::try_from(buf.get_i16())?;
    let weight = buf.get_i16();
    let sign = buf.get_u16();
    let dscale = usize::from(buf.get_u16());

    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    if buf.remaining() < ndigits * 2 {
        return Err("numeric digit buffer truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|_| buf.get_i16()).collect();

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight as usize {
            let d = digits.get(i).copied().unwrap_or(0);
            if i == 0 {
                write!(text, "{d}")?;
            } else {
                write!(text, "{d:04}")?;
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = i32::from(weight) + 1;
        while frac.len() < dscale {
            let d = usize::try_from(idx).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0);
            write!(frac, "{d:04}")?;
            idx += 1;
        }
        frac.truncate(dscale);
        text.push('.');
        text.push_str(&frac);
    }

    Ok(text)
}

/// Encode decimal text into the binary NUMERIC format
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<(), BoxError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("nan") {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(NUMERIC_NAN);
        out.put_u16(0);
        return Ok(());
    }

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_digits, frac_digits) = unsigned.split_once('.').unwrap_or((unsigned, ""));

    let well_formed = !(int_digits.is_empty() && frac_digits.is_empty())
        && int_digits.bytes().chain(frac_digits.bytes()).all(|b| b.is_ascii_digit());
    if !well_formed {
        return Err(format!("invalid numeric literal '{text}'").into());
    }

    let int_digits = int_digits.trim_start_matches('0');
    let dscale = u16::try_from(frac_digits.len())?;
    let int_pad = (4 - int_digits.len() % 4) % 4;
    let frac_pad = (4 - frac_digits.len() % 4) % 4;
    let padded = format!("{}{int_digits}{frac_digits}{}", "0".repeat(int_pad), "0".repeat(frac_pad));

    let mut groups: Vec<i16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0')))
        .collect();
    let mut weight = i16::try_from((int_pad + int_digits.len()) / 4)? - 1;

    let leading = groups.iter().take_while(|d| **d == 0).count();
    groups.drain(..leading);
    weight -= i16::try_from(leading)?;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let (weight, sign) = if groups.is_empty() {
        (0, NUMERIC_POS)
    } else {
        (weight, if negative { NUMERIC_NEG } else { NUMERIC_POS })
    };

    out.put_i16(i16::try_from(groups.len())?);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(dscale);
    for group in groups {
        out.put_i16(group);
    }
    Ok(())
}
