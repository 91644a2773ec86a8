//! Bounded connection pool.
//!
//! Connections are opened lazily up to `max_size`. A caller that finds the
//! pool exhausted waits on a condition variable until a connection is
//! returned or `wait_timeout` elapses, in which case it gets
//! [`StoreError::Unavailable`]. A connection borrowed from the pool is never
//! shared: it is handed to exactly one [`PooledConnection`] at a time.

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Opens new backend connections for a [`Pool`].
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send;

    fn connect(&self) -> StoreResult<Self::Connection>;
}

/// Pool sizing and wait policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened eagerly when the pool is created.
    pub min_size: usize,
    /// Upper bound on open connections.
    pub max_size: usize,
    /// How long `get` waits for a free connection.
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            wait_timeout: Duration::from_secs(30),
        }
    }
}

struct PoolState<C> {
    idle: Vec<C>,
    open: usize,
}

/// A bounded pool of connections produced by `F`.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    available: Condvar,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool and open `min_size` connections up front.
    pub fn new(factory: F, config: PoolConfig) -> StoreResult<Self> {
        if config.max_size == 0 {
            return Err(StoreError::Backend("pool max_size must be at least 1".into()));
        }
        let warm = config.min_size.min(config.max_size);
        let mut idle = Vec::with_capacity(config.max_size);
        for _ in 0..warm {
            idle.push(factory.connect()?);
        }
        debug!(warm, max = config.max_size, "connection pool created");
        Ok(Self {
            factory,
            state: Mutex::new(PoolState { open: idle.len(), idle }),
            config,
            available: Condvar::new(),
        })
    }

    /// Borrow a connection, waiting up to `wait_timeout` if the pool is
    /// exhausted.
    pub fn get(&self) -> StoreResult<PooledConnection<'_, F>> {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }

            if state.open < self.config.max_size {
                state.open += 1;
                drop(state);
                return match self.factory.connect() {
                    Ok(conn) => Ok(PooledConnection {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(err) => {
                        self.state.lock().open -= 1;
                        self.available.notify_one();
                        Err(err)
                    }
                };
            }

            let timed_out = self.available.wait_until(&mut state, deadline).timed_out();
            // A slot freed by `discard` shows up as spare capacity, not as an
            // idle connection.
            if timed_out && state.idle.is_empty() && state.open >= self.config.max_size {
                warn!(
                    open = state.open,
                    timeout_ms = self.config.wait_timeout.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(StoreError::Unavailable(format!(
                    "connection pool exhausted ({} connections in use)",
                    state.open
                )));
            }
        }
    }

    /// Number of connections currently open (idle or borrowed).
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    /// Number of idle connections.
    pub fn idle_connections(&self) -> usize {
        self.state.lock().idle.len()
    }

    fn release(&self, conn: F::Connection) {
        self.state.lock().idle.push(conn);
        self.available.notify_one();
    }
}

/// A connection borrowed from a [`Pool`]; returned on drop.
pub struct PooledConnection<'a, F: ConnectionFactory> {
    pool: &'a Pool<F>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> PooledConnection<'_, F> {
    /// Close this connection instead of returning it to the pool.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.state.lock().open -= 1;
            self.pool.available.notify_one();
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<'_, F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, and both consume self.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    struct Counter {
        opened: AtomicUsize,
        fail: bool,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                opened: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl ConnectionFactory for Counter {
        type Connection = usize;

        fn connect(&self) -> StoreResult<usize> {
            if self.fail {
                return Err(StoreError::Unavailable("refused".into()));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn config(min: usize, max: usize, wait_ms: u64) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            wait_timeout: Duration::from_millis(wait_ms),
        }
    }

    #[test]
    fn warms_min_size() {
        let pool = Pool::new(Counter::new(), config(2, 4, 10)).unwrap();
        assert_eq!(pool.open_connections(), 2);
        assert_eq!(pool.idle_connections(), 2);
    }

    #[test]
    fn connections_are_reused() {
        let pool = Pool::new(Counter::new(), config(0, 4, 10)).unwrap();
        let first = *pool.get().unwrap();
        let second = *pool.get().unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.open_connections(), 1);
    }

    #[test]
    fn concurrent_borrows_get_distinct_connections() {
        let pool = Pool::new(Counter::new(), config(0, 4, 10)).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(*a, *b);
        assert_eq!(pool.open_connections(), 2);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = Pool::new(Counter::new(), config(1, 1, 20)).unwrap();
        let _held = pool.get().unwrap();
        let err = pool.get().err().expect("pool should be exhausted");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn waiter_gets_released_connection() {
        let pool = Arc::new(Pool::new(Counter::new(), config(1, 1, 2_000)).unwrap());
        let held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get().map(|c| *c))
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn discard_frees_a_slot() {
        let pool = Pool::new(Counter::new(), config(0, 1, 10)).unwrap();
        pool.get().unwrap().discard();
        assert_eq!(pool.open_connections(), 0);
        assert_eq!(*pool.get().unwrap(), 1);
    }

    #[test]
    fn waiter_opens_connection_after_discard() {
        let pool = Arc::new(Pool::new(Counter::new(), config(1, 1, 2_000)).unwrap());
        let held = pool.get().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.get().map(|c| *c))
        };
        thread::sleep(Duration::from_millis(20));
        held.discard();

        assert_eq!(waiter.join().unwrap().unwrap(), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[test]
    fn failed_connect_releases_slot() {
        let factory = Counter {
            opened: AtomicUsize::new(0),
            fail: true,
        };
        let pool = Pool::new(factory, config(0, 1, 10)).unwrap();
        assert!(pool.get().is_err());
        assert_eq!(pool.open_connections(), 0);
    }

    #[test]
    fn zero_max_size_rejected() {
        assert!(Pool::new(Counter::new(), config(0, 0, 10)).is_err());
    }
}
