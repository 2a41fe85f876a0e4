//! Connection Pool Manager
//!
//! Owns the native pool for one connect/close cycle and hands out verified
//! connections.
//!
//! # Lifecycle
//! `Uninitialized → Active → Closed`. `Closed` is terminal: a new cycle needs
//! a new [`PoolManager`]. There is no process-wide pool; the manager is an
//! explicit handle passed to the engine.
//!
//! # Checkout Discipline
//! - concurrency is bounded by a semaphore sized to `max`
//! - waiting longer than `queue_timeout` fails with a connection timeout
//! - every checkout is probed; a stale connection is discarded and exactly
//!   one replacement is tried
//! - releasing never fails from the caller's point of view

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::driver::{NativeConnection, NativeDriver, NativeError, NativePool};
use crate::error::{classify_connection, ClassifiedError, ErrorKind, Result};

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Connections opened when the pool is created
    pub min: u32,
    /// Upper bound on simultaneously open connections
    pub max: u32,
    /// Connections opened at a time when the pool grows
    pub increment: u32,
    /// Idle time before the driver checks a pooled connection (TCP keepalive); `0` turns it off
    pub ping_interval_secs: u64,
    /// Longest a caller waits for a connection
    pub queue_timeout_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { min: 1, max: 4, increment: 1, ping_interval_secs: 60, queue_timeout_ms: 60_000 }
    }
}

impl PoolOptions {
    #[must_use]
    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Check sizing invariants
    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(ClassifiedError::config(ErrorKind::ConfigInvalidValue, "pool.max must be at least 1"));
        }
        if self.min > self.max {
            return Err(ClassifiedError::config(
                ErrorKind::ConfigInvalidValue,
                format!("pool.min ({}) exceeds pool.max ({})", self.min, self.max),
            ));
        }
        if self.increment == 0 {
            return Err(ClassifiedError::config(
                ErrorKind::ConfigInvalidValue,
                "pool.increment must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Observable pool state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Uninitialized,
    Active,
    Closed,
}

enum CheckoutFailure {
    /// The pool could not hand out a connection
    Checkout(NativeError),
    /// A connection was handed out but failed its liveness probe
    Stale(NativeError),
}

impl CheckoutFailure {
    const fn native(&self) -> &NativeError {
        match self {
            Self::Checkout(e) | Self::Stale(e) => e,
        }
    }
}

enum PoolState<P> {
    Uninitialized,
    Active(Arc<P>),
    Closed,
}

/// A connection borrowed from the pool for the duration of one operation
///
/// Hand it back with [`PoolManager::release_connection`]. Dropping it
/// without releasing still frees the concurrency slot.
pub struct PooledConnection<P: NativePool> {
    conn: P::Connection,
    pool: Arc<P>,
    _permit: OwnedSemaphorePermit,
}

impl<P: NativePool> PooledConnection<P> {
    /// The native connection
    pub fn native(&mut self) -> &mut P::Connection {
        &mut self.conn
    }
}

/// Owner of the native pool and its lifecycle
pub struct PoolManager<D: NativeDriver> {
    driver: D,
    options: PoolOptions,
    state: Mutex<PoolState<D::Pool>>,
    permits: Arc<Semaphore>,
}

impl<D: NativeDriver> PoolManager<D> {
    pub fn new(driver: D, options: PoolOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max.max(1) as usize));
        Self { driver, options, state: Mutex::new(PoolState::Uninitialized), permits }
    }

    pub const fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Backend name of the underlying driver
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn status(&self) -> PoolStatus {
        match &*self.lock_state() {
            PoolState::Uninitialized => PoolStatus::Uninitialized,
            PoolState::Active(_) => PoolStatus::Active,
            PoolState::Closed => PoolStatus::Closed,
        }
    }

    /// Connections currently checked out
    pub fn in_use(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        (self.options.max.max(1) as usize).saturating_sub(self.permits.available_permits())
    }

    /// Create the native pool
    ///
    /// On failure the manager stays `Uninitialized` and the error is
    /// connection-class.
    pub async fn create_pool(&self, config: &ConnectionConfig) -> Result<()> {
        match &*self.lock_state() {
            PoolState::Uninitialized => {}
            PoolState::Active(_) => {
                return Err(ClassifiedError::pool_unavailable("A connection pool is already active"));
            }
            PoolState::Closed => {
                return Err(ClassifiedError::pool_unavailable("The connection pool has been closed"));
            }
        }

        info!(
            host = %config.host,
            port = config.port,
            service = %config.service_name,
            user = %config.user,
            min = self.options.min,
            max = self.options.max,
            "creating connection pool"
        );

        let timeout = self.options.queue_timeout();
        let pool = match tokio::time::timeout(timeout, self.driver.create_pool(config, &self.options)).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(e)) => return Err(classify_connection(&e)),
            Err(_) => {
                return Err(ClassifiedError::connection_timeout(format!(
                    "Pool creation did not complete within {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let redundant = {
            let mut state = self.lock_state();
            if matches!(*state, PoolState::Uninitialized) {
                *state = PoolState::Active(Arc::new(pool));
                None
            } else {
                Some(pool)
            }
        };

        let Some(pool) = redundant else {
            info!("connection pool active");
            return Ok(());
        };
        if let Err(e) = pool.close().await {
            warn!(error = %e, "failed to close redundant pool");
        }
        Err(ClassifiedError::pool_unavailable("The pool changed state while it was being created"))
    }

    /// Check out a verified connection
    pub async fn get_connection(&self) -> Result<PooledConnection<D::Pool>> {
        let pool = self.active_pool()?;
        let timeout = self.options.queue_timeout();

        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClassifiedError::pool_unavailable("The connection pool has been closed")),
            Err(_) => {
                return Err(ClassifiedError::connection_timeout(format!(
                    "Timed out after {}ms waiting for a pooled connection",
                    timeout.as_millis()
                )));
            }
        };

        let conn = match self.checkout_probed(&pool).await {
            Ok(conn) => conn,
            Err(CheckoutFailure::Checkout(e)) => return Err(classify_connection(&e)),
            Err(CheckoutFailure::Stale(e)) => {
                warn!(error = %e, "stale connection discarded, retrying checkout once");
                self.checkout_probed(&pool).await.map_err(|f| classify_connection(f.native()))?
            }
        };

        Ok(PooledConnection { conn, pool, _permit: permit })
    }

    /// Return a connection to the pool; failures are logged, never raised
    pub async fn release_connection(&self, pooled: PooledConnection<D::Pool>) {
        let PooledConnection { conn, pool, _permit } = pooled;
        if let Err(e) = pool.release(conn).await {
            warn!(error = %e, "failed to release connection");
        }
    }

    /// Close the pool immediately; idempotent
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lock_state(), PoolState::Closed);
        let PoolState::Active(pool) = previous else {
            return Ok(());
        };

        self.permits.close();
        info!("closing connection pool");
        pool.close().await.map_err(|e| classify_connection(&e))
    }

    fn active_pool(&self) -> Result<Arc<D::Pool>> {
        match &*self.lock_state() {
            PoolState::Active(pool) => Ok(Arc::clone(pool)),
            PoolState::Uninitialized => Err(ClassifiedError::pool_unavailable("The connection pool is not initialized")),
            PoolState::Closed => Err(ClassifiedError::pool_unavailable("The connection pool has been closed")),
        }
    }

    /// Checkout plus liveness probe; a connection failing the probe is closed
    async fn checkout_probed(
        &self,
        pool: &D::Pool,
    ) -> std::result::Result<<D::Pool as NativePool>::Connection, CheckoutFailure> {
        let timeout = self.options.queue_timeout();
        let mut conn = match tokio::time::timeout(timeout, pool.checkout()).await {
            Ok(result) => result.map_err(CheckoutFailure::Checkout)?,
            Err(_) => {
                return Err(CheckoutFailure::Checkout(NativeError::new(
                    "connect timeout while checking out a connection",
                )));
            }
        };

        match conn.ping().await {
            Ok(()) => Ok(conn),
            Err(e) => {
                let _ = conn.close().await;
                Err(CheckoutFailure::Stale(e))
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<D::Pool>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_defaults() {
        let options = PoolOptions::default();
        assert_eq!(options.max, 4);
        assert_eq!(options.queue_timeout(), Duration::from_secs(60));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_pool_options_validation() {
        let options = PoolOptions { min: 5, max: 2, ..PoolOptions::default() };
        let err = options.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigInvalidValue);

        let options = PoolOptions { max: 0, min: 0, ..PoolOptions::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_pool_options_partial_json() {
        let options: PoolOptions = serde_json::from_str(r#"{"max": 10}"#).unwrap();
        assert_eq!(options.max, 10);
        assert_eq!(options.min, 1);
    }
}
