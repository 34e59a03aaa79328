//! Connection pooling and per-tier connection sourcing.
//!
//! [`Pool`] is a small blocking pool: idle connections are reused, new ones
//! are opened up to `max_size`, and callers wait on a condition variable when
//! the pool is exhausted. [`ConnectionSource`] picks between a shared
//! connection, a connection per operation and a pool according to the
//! driver's thread-safety level.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use middlestore_core::error::{ConnectionErrorKind, ThreadingConfigurationError};
use middlestore_core::{Error, Result, Value};

use crate::connection::{Connection, Driver, Row, connection_error};

/// How long [`Pool::get`] waits for a connection before failing.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Pool
// ============================================================================

struct PoolState {
    idle: Vec<Box<dyn Connection>>,
    open: usize,
}

struct PoolShared {
    driver: Arc<dyn Driver>,
    max_size: usize,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Blocking connection pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool")
            .field("driver", &self.shared.driver.name())
            .field("max_size", &self.shared.max_size)
            .field("open", &stats.open)
            .field("idle", &stats.idle)
            .finish()
    }
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
}

impl Pool {
    pub fn new(driver: Arc<dyn Driver>, max_size: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                driver,
                max_size: max_size.max(1),
                acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
        }
    }

    /// Check out a connection, opening one if the pool has room.
    pub fn get(&self) -> Result<PooledConnection> {
        let mut state = self.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(self.clone(), conn));
            }
            if state.open < self.shared.max_size {
                state.open += 1;
                drop(state);
                return match self.shared.driver.connect() {
                    Ok(conn) => {
                        tracing::debug!(driver = self.shared.driver.name(), "Opened pooled connection");
                        Ok(PooledConnection::new(self.clone(), conn))
                    }
                    Err(e) => {
                        self.lock().open -= 1;
                        self.shared.available.notify_one();
                        Err(e)
                    }
                };
            }
            let (guard, timeout) = self
                .shared
                .available
                .wait_timeout(state, self.shared.acquire_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if timeout.timed_out() && state.idle.is_empty() && state.open >= self.shared.max_size {
                return Err(connection_error(
                    ConnectionErrorKind::Pool,
                    format!(
                        "timed out waiting for one of {} pooled connections",
                        self.shared.max_size
                    ),
                ));
            }
        }
    }

    fn give_back(&self, conn: Box<dyn Connection>) {
        self.lock().idle.push(conn);
        self.shared.available.notify_one();
    }
}

/// A connection checked out of a [`Pool`]; returned on drop.
pub struct PooledConnection {
    pool: Pool,
    conn: Box<dyn Connection>,
}

impl PooledConnection {
    fn new(pool: Pool, conn: Box<dyn Connection>) -> Self {
        Self { pool, conn }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = std::mem::replace(&mut self.conn, Box::new(Released));
        self.pool.give_back(conn);
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

/// Placeholder left behind once a pooled connection is handed back.
struct Released;

impl Connection for Released {
    fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Err(connection_error(ConnectionErrorKind::Closed, "connection was returned to the pool"))
    }

    fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Err(connection_error(ConnectionErrorKind::Closed, "connection was returned to the pool"))
    }

    fn last_insert_id(&mut self) -> Result<i64> {
        Err(connection_error(ConnectionErrorKind::Closed, "connection was returned to the pool"))
    }
}

// ============================================================================
// Connection Source
// ============================================================================

/// Where connections come from for one SQL store.
pub enum ConnectionSource {
    /// One connection reused by every thread.
    Shared(Mutex<Box<dyn Connection>>),
    /// A fresh connection per logical operation.
    PerOperation(Arc<dyn Driver>),
    Pooled(Pool),
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSource::Shared(_) => f.write_str("Shared"),
            ConnectionSource::PerOperation(d) => write!(f, "PerOperation({})", d.name()),
            ConnectionSource::Pooled(p) => write!(f, "{p:?}"),
        }
    }
}

impl ConnectionSource {
    /// Choose a source for `driver`.
    ///
    /// Non-threaded stores always share one connection. Threaded stores use
    /// the pool when `pool_size > 0`, otherwise a connection per operation at
    /// level 1 and a shared connection at levels 2 and 3. Level 0 cannot be
    /// used from several threads at all.
    pub fn for_driver(driver: Arc<dyn Driver>, threaded: bool, pool_size: usize) -> Result<Self> {
        let safety = driver.thread_safety();
        if !threaded {
            return Ok(ConnectionSource::Shared(Mutex::new(driver.connect()?)));
        }
        if safety == 0 {
            return Err(Error::ThreadingConfiguration(ThreadingConfigurationError {
                driver: driver.name().to_string(),
                thread_safety: safety,
                message: "threaded is true, but the driver's thread safety is 0".to_string(),
            }));
        }
        if pool_size > 0 {
            return Ok(ConnectionSource::Pooled(Pool::new(driver, pool_size)));
        }
        if safety == 1 {
            Ok(ConnectionSource::PerOperation(driver))
        } else {
            Ok(ConnectionSource::Shared(Mutex::new(driver.connect()?)))
        }
    }

    /// Connection for one logical operation.
    pub fn acquire(&self) -> Result<SourcedConnection<'_>> {
        Ok(match self {
            ConnectionSource::Shared(conn) => {
                SourcedConnection::Shared(conn.lock().unwrap_or_else(PoisonError::into_inner))
            }
            ConnectionSource::PerOperation(driver) => SourcedConnection::Owned(driver.connect()?),
            ConnectionSource::Pooled(pool) => SourcedConnection::Pooled(pool.get()?),
        })
    }
}

/// A connection borrowed from a [`ConnectionSource`].
pub enum SourcedConnection<'a> {
    Shared(MutexGuard<'a, Box<dyn Connection>>),
    Owned(Box<dyn Connection>),
    Pooled(PooledConnection),
}

impl Deref for SourcedConnection<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            SourcedConnection::Shared(guard) => guard.as_ref(),
            SourcedConnection::Owned(conn) => conn.as_ref(),
            SourcedConnection::Pooled(pooled) => &**pooled,
        }
    }
}

impl DerefMut for SourcedConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            SourcedConnection::Shared(guard) => guard.as_mut(),
            SourcedConnection::Owned(conn) => conn.as_mut(),
            SourcedConnection::Pooled(pooled) => &mut **pooled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullConnection;

    impl Connection for NullConnection {
        fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }

        fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn last_insert_id(&mut self) -> Result<i64> {
            Ok(0)
        }
    }

    struct CountingDriver {
        safety: u8,
        opened: AtomicUsize,
    }

    impl CountingDriver {
        fn new(safety: u8) -> Arc<Self> {
            Arc::new(Self {
                safety,
                opened: AtomicUsize::new(0),
            })
        }
    }

    impl Driver for CountingDriver {
        fn name(&self) -> &str {
            "counting"
        }

        fn thread_safety(&self) -> u8 {
            self.safety
        }

        fn connect(&self) -> Result<Box<dyn Connection>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullConnection))
        }
    }

    #[test]
    fn test_pool_reuses_connections() {
        let driver = CountingDriver::new(1);
        let pool = Pool::new(driver.clone(), 2);
        {
            let _a = pool.get().unwrap();
            let _b = pool.get().unwrap();
            assert_eq!(pool.stats(), PoolStats { open: 2, idle: 0 });
        }
        assert_eq!(pool.stats(), PoolStats { open: 2, idle: 2 });
        let _c = pool.get().unwrap();
        assert_eq!(driver.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pool_waits_for_release() {
        let driver = CountingDriver::new(1);
        let pool = Pool::new(driver, 1);
        let held = pool.get().unwrap();
        let other = pool.clone();
        let waiter = std::thread::spawn(move || other.get().map(|_| ()));
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_tier_selection() {
        let err = ConnectionSource::for_driver(CountingDriver::new(0), true, 0).unwrap_err();
        assert!(matches!(err, Error::ThreadingConfiguration(ref e) if e.thread_safety == 0));

        let source = ConnectionSource::for_driver(CountingDriver::new(0), false, 0).unwrap();
        assert!(matches!(source, ConnectionSource::Shared(_)));

        let source = ConnectionSource::for_driver(CountingDriver::new(1), true, 0).unwrap();
        assert!(matches!(source, ConnectionSource::PerOperation(_)));

        let source = ConnectionSource::for_driver(CountingDriver::new(1), true, 4).unwrap();
        assert!(matches!(source, ConnectionSource::Pooled(_)));

        let source = ConnectionSource::for_driver(CountingDriver::new(2), true, 0).unwrap();
        assert!(matches!(source, ConnectionSource::Shared(_)));
    }

    #[test]
    fn test_per_operation_opens_each_time() {
        let driver = CountingDriver::new(1);
        let source = ConnectionSource::for_driver(driver.clone(), true, 0).unwrap();
        for _ in 0..3 {
            let mut conn = source.acquire().unwrap();
            conn.execute("SELECT 1", &[]).unwrap();
        }
        assert_eq!(driver.opened.load(Ordering::SeqCst), 3);
    }
}
