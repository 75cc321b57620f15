//! Bounded pool of multiplexed connections.
//!
//! Callers check a [`Connection`] out with [`Pool::get`], send any number of
//! requests on it, and hand it back with [`Pool::put`] together with the
//! error (if any) they observed while using it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Pool                      │
//! │   capacity = idle + active (upper bound)     │
//! │                                              │
//! │   idle (FIFO)          active (checked out)  │
//! │   ┌───┬───┬───┐        ┌───┐ ┌───┐           │
//! │   │ 1 │ 2 │ 3 │  get → │ 4 │ │ 5 │  → put    │
//! │   └───┴───┴───┘        └───┘ └───┘           │
//! │    head      tail ← healthy returns          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! When the idle queue is empty and every slot is checked out, `get` parks
//! on a [`Notify`] until a `put`, `reset` or `close` wakes it, then
//! re-checks the state.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::options::PoolOptions;

use super::Connection;

// ============================================================================
// ConnectionPool
// ============================================================================

/// Checkout interface implemented by [`Pool`].
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Checks a connection out, waiting while the pool is exhausted.
    async fn get(&self) -> Result<Connection>;

    /// Returns a connection checked out by [`get`](Self::get).
    async fn put(&self, conn: Connection, error: Option<&Error>);

    /// Closes every idle connection and refuses further checkouts.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// PoolState
// ============================================================================

/// Fields guarded by the pool mutex.
#[derive(Default)]
struct PoolState {
    /// Available connections, oldest first.
    idle: VecDeque<Connection>,
    /// Connections checked out, including slots reserved for an in-flight dial.
    active: usize,
    /// Set by `close`.
    closed: bool,
}

/// Outcome of one pass over the pool state in `get`.
enum Checkout {
    Ready(Connection),
    Dial,
    Wait,
    Closed,
}

// ============================================================================
// Pool
// ============================================================================

/// Bounded blocking connection pool.
///
/// At every observation `idle_count() + active_count() <= capacity()`.
///
/// # Example
///
/// ```ignore
/// let pool = Pool::new(PoolOptions::new("127.0.0.1:3000").with_pool_size(5)).await?;
///
/// let conn = pool.get().await?;
/// let outcome = conn.send(&Request::generate("pixelpig!")).await;
/// pool.put(conn, outcome.as_ref().err()).await;
/// let reply = outcome?.await?;
/// ```
pub struct Pool {
    options: PoolOptions,
    state: Mutex<PoolState>,
    available: Notify,
}

// ============================================================================
// Pool - Constructor
// ============================================================================

impl Pool {
    /// Creates a pool and pre-dials `pool_size` idle connections.
    ///
    /// Warm-up is best-effort: dial failures are logged and simply leave
    /// fewer idle connections. Missing connections are dialed on demand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` fail validation.
    pub async fn new(options: PoolOptions) -> Result<Self> {
        options.validate()?;

        let mut idle = VecDeque::with_capacity(options.pool_size);
        for _ in 0..options.pool_size {
            match Connection::connect(&options).await {
                Ok(conn) => idle.push_back(conn),
                Err(e) => warn!(address = %options.address, error = %e, "Warm-up dial failed"),
            }
        }

        info!(
            address = %options.address,
            capacity = options.pool_size,
            idle = idle.len(),
            "Pool created"
        );

        Ok(Self {
            options,
            state: Mutex::new(PoolState {
                idle,
                ..PoolState::default()
            }),
            available: Notify::new(),
        })
    }
}

// ============================================================================
// Pool - Public API
// ============================================================================

impl Pool {
    /// Checks a connection out.
    ///
    /// Takes the oldest idle connection if there is one, otherwise dials a
    /// new one if the pool is under capacity, otherwise waits. Idle
    /// connections whose backend has since hung up are discarded on the way.
    ///
    /// Every successful call must be matched by exactly one
    /// [`put`](Self::put).
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is closed
    /// - [`Error::Dial`] / [`Error::DialTimeout`] if a new connection could
    ///   not be dialed; the pool's counts are left unchanged
    pub async fn get(&self) -> Result<Connection> {
        loop {
            // Register interest before inspecting state so a put() between
            // the check and the await is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut stale = Vec::new();
            let checkout = {
                let mut state = self.state.lock();
                if state.closed {
                    Checkout::Closed
                } else {
                    let mut found = None;
                    while let Some(conn) = state.idle.pop_front() {
                        if conn.is_closed() {
                            stale.push(conn);
                        } else {
                            found = Some(conn);
                            break;
                        }
                    }

                    match found {
                        Some(conn) => {
                            state.active += 1;
                            Checkout::Ready(conn)
                        }
                        None if state.active < self.options.pool_size => {
                            state.active += 1;
                            Checkout::Dial
                        }
                        None => Checkout::Wait,
                    }
                }
            };

            if !stale.is_empty() {
                debug!(count = stale.len(), "Discarded dead idle connections");
                drop(stale);
            }

            match checkout {
                Checkout::Ready(conn) => {
                    debug!(conn = conn.id(), "Reusing idle connection");
                    return Ok(conn);
                }
                Checkout::Dial => return self.dial_reserved().await,
                Checkout::Closed => return Err(Error::PoolClosed),
                Checkout::Wait => {
                    debug!(capacity = self.options.pool_size, "Pool exhausted, waiting");
                    notified.await;
                }
            }
        }
    }

    /// Returns a connection checked out by [`get`](Self::get).
    ///
    /// With `error` set, or if the connection has closed in the meantime,
    /// the connection is closed and discarded. Otherwise it joins the tail
    /// of the idle queue. Either way one checked-out slot is released and one
    /// waiter is woken.
    pub async fn put(&self, conn: Connection, error: Option<&Error>) {
        let discarded = {
            let mut state = self.state.lock();
            match state.active.checked_sub(1) {
                Some(active) => state.active = active,
                None => warn!(conn = conn.id(), "Put without a matching get"),
            }

            if let Some(e) = error {
                debug!(conn = conn.id(), error = %e, "Discarding connection after caller error");
                Some(conn)
            } else if conn.is_closed() {
                debug!(conn = conn.id(), "Discarding closed connection");
                Some(conn)
            } else if state.closed {
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            }
        };

        self.available.notify_one();

        if let Some(conn) = discarded
            && let Err(e) = conn.close().await
        {
            debug!(conn = conn.id(), error = %e, "Close of discarded connection failed");
        }
    }

    /// Replaces every idle connection with a freshly dialed one.
    ///
    /// Dials one connection per slot not currently checked out (the full
    /// capacity when nothing is checked out). Checked-out connections are
    /// untouched and keep their slots; they come back through
    /// [`put`](Self::put) as usual. The previous idle connections are closed
    /// after the swap.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is closed
    /// - the dial error if any fresh connection fails; connections dialed so
    ///   far are closed and the pool is left as it was
    pub async fn reset(&self) -> Result<()> {
        let wanted = {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            self.options.pool_size.saturating_sub(state.active)
        };

        let mut fresh = VecDeque::with_capacity(wanted);
        for _ in 0..wanted {
            match Connection::connect(&self.options).await {
                Ok(conn) => fresh.push_back(conn),
                Err(e) => {
                    warn!(error = %e, dialed = fresh.len(), "Reset aborted");
                    close_all(fresh).await;
                    return Err(e);
                }
            }
        }

        let swapped = {
            let mut state = self.state.lock();
            if state.closed {
                Err(fresh)
            } else {
                // Callers may have checked out old idle connections while we dialed.
                let room = self.options.pool_size.saturating_sub(state.active);
                let surplus = fresh.split_off(room.min(fresh.len()));
                let old = std::mem::replace(&mut state.idle, fresh);
                Ok((old, surplus))
            }
        };

        let (old, surplus) = match swapped {
            Ok(swapped) => swapped,
            Err(fresh) => {
                close_all(fresh).await;
                return Err(Error::PoolClosed);
            }
        };

        self.available.notify_waiters();

        info!(
            replaced = old.len(),
            surplus = surplus.len(),
            "Pool reset"
        );

        close_all(old).await;
        close_all(surplus).await;
        Ok(())
    }

    /// Closes every idle connection and marks the pool closed.
    ///
    /// Waiters in [`get`](Self::get) wake with [`Error::PoolClosed`].
    /// Checked-out connections are not reached; they are closed when
    /// returned through [`put`](Self::put).
    ///
    /// # Errors
    ///
    /// Returns the first error from closing an idle connection. Every idle
    /// connection is closed regardless.
    pub async fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };

        self.available.notify_waiters();

        let count = idle.len();
        let mut first_error = None;
        for conn in idle {
            if let Err(e) = conn.close().await {
                warn!(conn = conn.id(), error = %e, "Idle connection close failed");
                first_error.get_or_insert(e);
            }
        }

        info!(closed = count, "Pool closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the maximum number of connections.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.options.pool_size
    }

    /// Returns the number of idle connections.
    #[inline]
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Returns the number of checked-out connections.
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
}

// ============================================================================
// Pool - Internals
// ============================================================================

impl Pool {
    /// Dials into a slot already counted in `active`.
    async fn dial_reserved(&self) -> Result<Connection> {
        let reservation = Reservation { pool: self };
        let conn = Connection::connect(&self.options).await.inspect_err(|e| {
            warn!(address = %self.options.address, error = %e, "Dial failed");
        })?;
        reservation.commit();
        debug!(conn = conn.id(), "Dialed new connection");
        Ok(conn)
    }

    /// Gives back a reserved slot and wakes one waiter.
    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.available.notify_one();
    }
}

/// Slot held for a dial in progress.
///
/// Released on drop, which covers both a failed dial and a caller that stops
/// polling `get` mid-dial.
struct Reservation<'a> {
    pool: &'a Pool,
}

impl Reservation<'_> {
    /// Keeps the slot: the dialed connection now occupies it.
    fn commit(self) {
        std::mem::forget(self);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pool.release_slot();
    }
}

/// Closes each connection in turn.
async fn close_all(conns: impl IntoIterator<Item = Connection>) {
    for conn in conns {
        if let Err(e) = conn.close().await {
            debug!(conn = conn.id(), error = %e, "Close failed");
        }
    }
}

#[async_trait]
impl ConnectionPool for Pool {
    async fn get(&self) -> Result<Connection> {
        Pool::get(self).await
    }

    async fn put(&self, conn: Connection, error: Option<&Error>) {
        Pool::put(self, conn, error).await;
    }

    async fn close(&self) -> Result<()> {
        Pool::close(self).await
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Pool")
            .field("address", &self.options.address)
            .field("capacity", &self.options.pool_size)
            .field("idle", &state.idle.len())
            .field("active", &state.active)
            .field("closed", &state.closed)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
