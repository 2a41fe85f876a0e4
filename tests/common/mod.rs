//! Scripted in-memory driver for engine and pool tests
//!
//! Every call is appended to a shared log so tests can assert the exact
//! sequence of checkouts, probes, statements, commits and releases.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sqlwarden::driver::{
    ExecuteOptions, NativeConnection, NativeDriver, NativeError, NativePool, NativeValue, RawResult,
};
use sqlwarden::{ColumnDescriptor, ConnectionConfig, Engine, PoolManager, PoolOptions, SecurityPolicy};

#[derive(Default)]
pub struct Script {
    pub calls: Vec<String>,
    pub create_failure: Option<NativeError>,
    pub create_delay: Option<Duration>,
    pub checkout_failures: VecDeque<NativeError>,
    pub ping_failures: VecDeque<NativeError>,
    pub responses: VecDeque<Result<RawResult, NativeError>>,
    pub execute_delay: Option<Duration>,
    pub commit_failure: Option<NativeError>,
    pub rollback_failure: Option<NativeError>,
    pub release_failure: Option<NativeError>,
    pub explain_lines: Vec<String>,
    pub last_options: Option<ExecuteOptions>,
    pub last_binds: Vec<serde_json::Value>,
    pub open: usize,
    pub max_open: usize,
}

#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    /// Calls recorded after pool creation
    pub fn calls_since_create(&self) -> Vec<String> {
        let calls = self.calls();
        match calls.iter().position(|c| c == "create_pool") {
            Some(i) => calls[i + 1..].to_vec(),
            None => calls,
        }
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }

    pub fn respond(&self, response: Result<RawResult, NativeError>) {
        self.script().responses.push_back(response);
    }
}

pub struct ScriptedPool {
    state: Arc<Mutex<Script>>,
}

pub struct ScriptedConnection {
    state: Arc<Mutex<Script>>,
}

fn log(state: &Mutex<Script>, call: impl Into<String>) -> MutexGuard<'_, Script> {
    let mut script = state.lock().unwrap();
    script.calls.push(call.into());
    script
}

#[async_trait]
impl NativeDriver for ScriptedDriver {
    type Pool = ScriptedPool;

    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_pool(&self, _config: &ConnectionConfig, _options: &PoolOptions) -> Result<ScriptedPool, NativeError> {
        let (delay, failure) = {
            let mut script = log(&self.state, "create_pool");
            (script.create_delay, script.create_failure.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(ScriptedPool { state: Arc::clone(&self.state) }),
        }
    }
}

#[async_trait]
impl NativePool for ScriptedPool {
    type Connection = ScriptedConnection;

    async fn checkout(&self) -> Result<ScriptedConnection, NativeError> {
        let mut script = log(&self.state, "checkout");
        if let Some(e) = script.checkout_failures.pop_front() {
            return Err(e);
        }
        script.open += 1;
        script.max_open = script.max_open.max(script.open);
        Ok(ScriptedConnection { state: Arc::clone(&self.state) })
    }

    async fn release(&self, _conn: ScriptedConnection) -> Result<(), NativeError> {
        let mut script = log(&self.state, "release");
        script.open -= 1;
        match script.release_failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), NativeError> {
        log(&self.state, "pool_close");
        Ok(())
    }
}

#[async_trait]
impl NativeConnection for ScriptedConnection {
    async fn execute(
        &mut self,
        sql: &str,
        binds: &[serde_json::Value],
        options: &ExecuteOptions,
    ) -> Result<RawResult, NativeError> {
        let (delay, response) = {
            let mut script = log(&self.state, format!("execute {sql}"));
            script.last_options = Some(*options);
            script.last_binds = binds.to_vec();
            (script.execute_delay, script.responses.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response.unwrap_or_else(|| Ok(RawResult::default()))
    }

    async fn ping(&mut self) -> Result<(), NativeError> {
        match log(&self.state, "ping").ping_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn commit(&mut self) -> Result<(), NativeError> {
        match log(&self.state, "commit").commit_failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<(), NativeError> {
        match log(&self.state, "rollback").rollback_failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn explain_plan(&mut self, sql: &str) -> Result<Vec<String>, NativeError> {
        Ok(log(&self.state, format!("explain {sql}")).explain_lines.clone())
    }

    async fn close(self) -> Result<(), NativeError> {
        log(&self.state, "close_conn").open -= 1;
        Ok(())
    }
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new("db.test", 1521, "TESTPDB", "agent", "secret")
}

pub fn quick_options() -> PoolOptions {
    PoolOptions { queue_timeout_ms: 200, ..PoolOptions::default() }
}

/// A manager over `driver` whose pool has been created
pub async fn active_pool(driver: &ScriptedDriver, options: PoolOptions) -> Arc<PoolManager<ScriptedDriver>> {
    let manager = PoolManager::new(driver.clone(), options);
    manager.create_pool(&connection_config()).await.unwrap();
    Arc::new(manager)
}

pub async fn engine(driver: &ScriptedDriver, policy: SecurityPolicy) -> Engine<ScriptedDriver> {
    Engine::new(active_pool(driver, quick_options()).await, policy)
}

/// Build a raw result from `(name, native_type)` columns and positional rows
pub fn result(columns: &[(&str, &str)], rows: Vec<Vec<NativeValue>>) -> RawResult {
    RawResult {
        columns: columns.iter().map(|(name, ty)| ColumnDescriptor::new(*name, *ty)).collect(),
        rows,
        rows_affected: None,
    }
}

pub fn affected(n: u64) -> RawResult {
    RawResult { rows_affected: Some(n), ..RawResult::default() }
}

pub fn int_rows(n: i64) -> Vec<Vec<NativeValue>> {
    (1..=n).map(|i| vec![NativeValue::Int(i)]).collect()
}
