//! Asynchronous connection pool.
//!
//! Sessions are created lazily up to `pool_max_size`. When none is available
//! callers queue in FIFO order and a released session is handed directly to
//! the oldest waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::opts::Opts;

use super::Conn;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens new connections for a pool.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Conn>>;
}

impl Connect for Opts {
    fn connect(&self) -> BoxFuture<'_, Result<Conn>> {
        Box::pin(Conn::connect(self.clone()))
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Sessions owned by the pool, including ones being opened
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
}

#[derive(Debug)]
struct IdleConn {
    conn: Conn,
    since: Instant,
}

type Waiter = oneshot::Sender<Result<Conn>>;

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<IdleConn>,
    live: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolState {
    /// Give `conn` to the oldest waiter still listening.
    fn hand_off(&mut self, mut conn: Conn) -> Option<Conn> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Ok(conn)) {
                Ok(()) => return None,
                Err(returned) => {
                    trace!("waiter gone; trying the next one");
                    let Ok(back) = returned else {
                        return None;
                    };
                    conn = back;
                }
            }
        }
        Some(conn)
    }
}

struct Inner {
    opts: Opts,
    connector: Box<dyn Connect>,
    state: Mutex<PoolState>,
}

/// Connection pool. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

enum Checkout {
    Idle(IdleConn),
    Create,
    Wait(oneshot::Receiver<Result<Conn>>),
}

impl Pool {
    /// Pool connecting with [`Conn::connect`].
    pub fn new(opts: Opts) -> Result<Self> {
        let connector = opts.clone();
        Self::with_connector(opts, connector)
    }

    /// Pool opening sessions through a custom connector.
    pub fn with_connector<C: Connect>(opts: Opts, connector: C) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                opts,
                connector: Box::new(connector),
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            live: state.live,
            idle: state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Get a session.
    ///
    /// Fails with `PoolExhausted` when `pool_max_waiters` callers are already
    /// waiting.
    pub async fn acquire(&self) -> Result<PooledConn> {
        let conn = self.checkout().await?;
        Ok(PooledConn {
            pool: Some(self.clone()),
            conn,
        })
    }

    async fn checkout(&self) -> Result<Conn> {
        loop {
            let next = self.next_checkout()?;
            match next {
                Checkout::Idle(idle) => {
                    if idle.conn.is_closed() {
                        debug!("dropping dead idle session");
                        self.free_slot();
                        continue;
                    }
                    return self.validate(idle).await;
                }
                Checkout::Create => {
                    let slot = Reservation::new(self);
                    let conn = self.inner.connector.connect().await?;
                    slot.fulfil();
                    return Ok(conn);
                }
                Checkout::Wait(rx) => {
                    let waiter = WaiterGuard {
                        pool: self,
                        rx: Some(rx),
                    };
                    return waiter.wait().await;
                }
            }
        }
    }

    fn next_checkout(&self) -> Result<Checkout> {
        let opts = &self.inner.opts;
        let mut state = self.lock();
        if state.closed {
            return Err(Error::InvalidUsage("pool is closed".into()));
        }

        if let Some(timeout) = opts.pool_idle_timeout {
            let before = state.idle.len();
            state.idle.retain(|idle| {
                let keep = idle.since.elapsed() < timeout;
                if !keep {
                    idle.conn.close_in_background();
                }
                keep
            });
            let evicted = before - state.idle.len();
            if evicted > 0 {
                debug!(evicted, "closed expired idle sessions");
                state.live -= evicted;
            }
        }

        state.waiters.retain(|waiter| !waiter.is_closed());

        if let Some(idle) = state.idle.pop_front() {
            return Ok(Checkout::Idle(idle));
        }
        if state.live < opts.pool_max_size {
            state.live += 1;
            trace!(live = state.live, "opening session");
            return Ok(Checkout::Create);
        }
        let waiting = state.waiters.len();
        if opts.pool_max_waiters.is_some_and(|max| waiting >= max) {
            return Err(Error::PoolExhausted { waiters: waiting });
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        trace!(waiting = waiting + 1, "waiting for a session");
        Ok(Checkout::Wait(rx))
    }

    /// Ping a session that sat idle too long; replace it if it is dead.
    async fn validate(&self, idle: IdleConn) -> Result<Conn> {
        let stale = self
            .inner
            .opts
            .pool_validation_threshold
            .is_some_and(|threshold| idle.since.elapsed() >= threshold);
        if !stale {
            return Ok(idle.conn);
        }

        let slot = Reservation::new(self);
        let wait = self.inner.opts.pool_validation_timeout;
        let mut error = match tokio::time::timeout(wait, idle.conn.ping()).await {
            Ok(Ok(())) => {
                slot.fulfil();
                return Ok(idle.conn);
            }
            Ok(Err(err)) => err,
            Err(_elapsed) => Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "validation ping timed out",
            )),
        };
        warn!(%error, "idle session failed validation");
        // a ping that timed out is still queued; don't wait behind it
        idle.conn.abort_in_background();

        for attempt in 1..=self.inner.opts.pool_validation_retries {
            match self.inner.connector.connect().await {
                Ok(conn) => {
                    slot.fulfil();
                    return Ok(conn);
                }
                Err(err) => {
                    debug!(attempt, %err, "replacement connect failed");
                    error = err;
                }
            }
        }
        Err(error)
    }

    /// Return a session to the pool.
    fn check_in(&self, conn: Conn) {
        if conn.is_closed() {
            debug!("released session is gone");
            self.free_slot();
            return;
        }
        let mut state = self.lock();
        if state.closed {
            state.live = state.live.saturating_sub(1);
            conn.close_in_background();
            return;
        }
        if let Some(conn) = state.hand_off(conn) {
            state.idle.push_back(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
    }

    /// A session is gone for good. Open a replacement if someone is waiting.
    fn free_slot(&self) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        if state.closed || state.waiters.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.live += 1;
        drop(state);

        debug!("opening replacement session for waiter");
        let pool = self.clone();
        runtime.spawn(async move {
            match pool.inner.connector.connect().await {
                Ok(conn) => pool.check_in(conn),
                Err(err) => {
                    warn!(%err, "replacement connect failed");
                    let waiter = {
                        let mut state = pool.lock();
                        state.live = state.live.saturating_sub(1);
                        state.waiters.pop_front()
                    };
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(err));
                    }
                }
            }
        });
    }

    /// Refuse further acquires, fail waiters and close idle sessions.
    ///
    /// Sessions currently checked out are closed when released.
    pub fn close(&self) {
        let (waiters, idle) = {
            let mut state = self.lock();
            state.closed = true;
            let idle: Vec<IdleConn> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(idle.len());
            (std::mem::take(&mut state.waiters), idle)
        };
        debug!(waiters = waiters.len(), idle = idle.len(), "closing pool");
        for waiter in waiters {
            let _ = waiter.send(Err(Error::InvalidUsage("pool is closed".into())));
        }
        for idle in idle {
            idle.conn.close_in_background();
        }
    }
}

/// A slot counted in `live` while a session is being opened or revalidated.
/// Dropped without [`fulfil`](Self::fulfil), the slot is freed.
struct Reservation<'a> {
    pool: Option<&'a Pool>,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a Pool) -> Self {
        Self { pool: Some(pool) }
    }

    fn fulfil(mut self) {
        self.pool = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.free_slot();
        }
    }
}

/// A queued acquire. A session handed over after the caller gave up goes
/// back to the pool.
struct WaiterGuard<'a> {
    pool: &'a Pool,
    rx: Option<oneshot::Receiver<Result<Conn>>>,
}

impl WaiterGuard<'_> {
    async fn wait(mut self) -> Result<Conn> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Error::ConnectionLost);
        };
        let received = rx.await;
        self.rx = None;
        let conn = received.unwrap_or(Err(Error::ConnectionLost))?;
        Ok(conn)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        if let Ok(Ok(conn)) = rx.try_recv() {
            trace!("waiter dropped after handoff; returning session");
            self.pool.check_in(conn);
        }
    }
}

/// A session checked out of a [`Pool`].
///
/// Released on drop. After [`release`](Self::release) the handle is detached
/// and every call on it fails with `ConnectionLost`.
#[derive(Debug)]
pub struct PooledConn {
    pool: Option<Pool>,
    conn: Conn,
}

impl PooledConn {
    /// Give the session back to the pool. Calling it again does nothing.
    pub fn release(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let detached = Conn::detached(self.conn.protocol());
        let conn = std::mem::replace(&mut self.conn, detached);
        pool.check_in(conn);
    }
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.release();
    }
}
