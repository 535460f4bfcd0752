//! Connection pool
//!
//! Bounded pool with FIFO waiters. Invariants: `total <= max` at all times;
//! once warmed, idle pruning keeps at least `min` connections; a timed-out
//! acquire surfaces a capacity error carrying a stats snapshot. Connections
//! are returned on guard drop, so release happens on every exit path.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PoolError;

/// Creates and health-checks pool connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, String>;

    /// Health probe applied to idle connections before reuse.
    async fn is_healthy(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

/// Pool bounds and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// When set, the maintenance task prunes idle connections on this
    /// interval.
    pub health_check_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: None,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub created: u64,
    pub acquire_timeouts: u64,
}

struct ConnEntry<C> {
    id: Uuid,
    created_at: Instant,
    use_count: u64,
    conn: C,
}

struct IdleEntry<C> {
    entry: ConnEntry<C>,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    waiters: VecDeque<oneshot::Sender<ConnEntry<C>>>,
    total: usize,
    active: usize,
    created: u64,
    acquire_timeouts: u64,
    draining: bool,
}

struct PoolShared<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    drained: Notify,
}

impl<F: ConnectionFactory> PoolShared<F> {
    fn stats_locked(&self, state: &PoolState<F::Connection>) -> PoolStats {
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            active: state.active,
            waiting: state.waiters.len(),
            created: state.created,
            acquire_timeouts: state.acquire_timeouts,
        }
    }

    /// Hands a connection back: next FIFO waiter first, idle list otherwise.
    fn give_back(&self, mut entry: ConnEntry<F::Connection>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.draining {
            state.total = state.total.saturating_sub(1);
            if state.active == 0 {
                self.drained.notify_waiters();
            }
            return;
        }
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => match waiter.send(entry) {
                    Ok(()) => {
                        state.active += 1;
                        return;
                    }
                    // Receiver gave up (acquire timeout); try the next one.
                    Err(back) => entry = back,
                },
                None => {
                    state.idle.push_back(IdleEntry {
                        entry,
                        idle_since: Instant::now(),
                    });
                    return;
                }
            }
        }
    }

    /// Drops a connection permanently.
    fn discard(&self, _entry: ConnEntry<F::Connection>) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.total = state.total.saturating_sub(1);
        if state.draining && state.active == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// Guard for an acquired connection; dropping it releases back to the pool.
pub struct PooledConnection<F: ConnectionFactory> {
    entry: Option<ConnEntry<F::Connection>>,
    healthy: bool,
    shared: Arc<PoolShared<F>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> Uuid {
        self.entry.as_ref().map(|e| e.id).unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        self.entry
            .as_ref()
            .map(|e| e.created_at.elapsed())
            .unwrap_or_default()
    }

    pub fn use_count(&self) -> u64 {
        self.entry.as_ref().map(|e| e.use_count).unwrap_or_default()
    }

    /// Marks the connection broken; it is dropped instead of returned.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry.as_ref().expect("connection taken").conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry.as_mut().expect("connection taken").conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            if self.healthy {
                self.shared.give_back(entry);
            } else {
                self.shared.discard(entry);
            }
        }
    }
}

/// The pool handle; clones share state.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    total: 0,
                    active: 0,
                    created: 0,
                    acquire_timeouts: 0,
                    draining: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Pre-creates `min` connections.
    pub async fn warm(&self) -> Result<(), PoolError> {
        loop {
            {
                let state = self.shared.state.lock();
                if state.total >= self.shared.config.min || state.draining {
                    return Ok(());
                }
            }
            let conn = self
                .shared
                .factory
                .connect()
                .await
                .map_err(PoolError::Factory)?;
            let mut state = self.shared.state.lock();
            state.total += 1;
            state.created += 1;
            state.idle.push_back(IdleEntry {
                entry: new_entry(conn),
                idle_since: Instant::now(),
            });
        }
    }

    /// Acquires a connection: idle first, new while under `max`, otherwise
    /// a FIFO wait bounded by the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        loop {
            enum Path<C> {
                Reuse(ConnEntry<C>),
                Create,
                Wait(oneshot::Receiver<ConnEntry<C>>),
            }

            let path = {
                let mut state = self.shared.state.lock();
                if state.draining {
                    return Err(PoolError::Draining);
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.active += 1;
                    Path::Reuse(idle.entry)
                } else if state.total < self.shared.config.max {
                    state.total += 1;
                    state.created += 1;
                    Path::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Path::Wait(rx)
                }
            };

            match path {
                Path::Reuse(entry) => {
                    // Health probe happens outside the lock.
                    if self.shared.factory.is_healthy(&entry.conn).await {
                        return Ok(self.guard(entry));
                    }
                    debug!(id = %entry.id, "discarding unhealthy idle connection");
                    self.shared.discard(entry);
                    continue;
                }
                Path::Create => match self.shared.factory.connect().await {
                    Ok(conn) => {
                        let mut state = self.shared.state.lock();
                        state.active += 1;
                        drop(state);
                        return Ok(self.guard(new_entry(conn)));
                    }
                    Err(err) => {
                        let mut state = self.shared.state.lock();
                        state.total = state.total.saturating_sub(1);
                        drop(state);
                        return Err(PoolError::Factory(err));
                    }
                },
                Path::Wait(rx) => {
                    let timeout = self.shared.config.acquire_timeout;
                    match tokio::time::timeout(timeout, rx).await {
                        Ok(Ok(entry)) => return Ok(self.guard(entry)),
                        // Drain dropped the sender.
                        Ok(Err(_)) => return Err(PoolError::Draining),
                        Err(_) => {
                            let mut state = self.shared.state.lock();
                            state.acquire_timeouts += 1;
                            let stats = self.shared.stats_locked(&state);
                            drop(state);
                            warn!(timeout_ms = timeout.as_millis() as u64, "pool acquire timed out");
                            return Err(PoolError::AcquireTimeout {
                                timeout_ms: timeout.as_millis() as u64,
                                stats,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Runs `op` with an acquired connection, releasing on every exit path.
    pub async fn with_connection<T>(
        &self,
        op: impl for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, T>,
    ) -> Result<T, PoolError> {
        let mut guard = self.acquire().await?;
        let result = op(&mut guard).await;
        Ok(result)
    }

    /// Removes an idle connection by id.
    pub fn mark_unhealthy(&self, id: Uuid) {
        let mut state = self.shared.state.lock();
        let before = state.idle.len();
        state.idle.retain(|idle| idle.entry.id != id);
        let removed = before - state.idle.len();
        state.total = state.total.saturating_sub(removed);
        if removed > 0 {
            debug!(%id, "removed unhealthy connection from pool");
        }
    }

    /// Evicts idle connections older than `idle_timeout`, never dropping
    /// below `min` total.
    pub fn prune_idle(&self) {
        let mut state = self.shared.state.lock();
        let min = self.shared.config.min;
        let idle_timeout = self.shared.config.idle_timeout;
        while state.total > min {
            match state.idle.front() {
                Some(front) if front.idle_since.elapsed() > idle_timeout => {
                    state.idle.pop_front();
                    state.total -= 1;
                }
                _ => break,
            }
        }
    }

    /// Blocks new acquirers, rejects pending waiters, waits up to `timeout`
    /// for active connections to come back, then clears the pool. Returns
    /// whether the drain completed cleanly.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active_now = {
            let mut state = self.shared.state.lock();
            state.draining = true;
            // Rejected waiters observe the dropped sender.
            state.waiters.clear();
            let idle = state.idle.len();
            state.idle.clear();
            state.total = state.total.saturating_sub(idle);
            state.active
        };
        info!(active = active_now, "draining connection pool");

        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.state.lock().active == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("pool drain timed out with connections still active");
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.shared.drained.notified()).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        self.shared.stats_locked(&state)
    }

    /// Spawns the opportunistic maintenance task when a health-check
    /// interval is configured. The task stops once the pool is dropped.
    pub fn start_maintenance(&self) {
        let Some(interval) = self.shared.config.health_check_interval else {
            return;
        };
        let weak: Weak<PoolShared<F>> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let pool = ConnectionPool { shared };
                pool.prune_idle();
            }
        });
    }

    fn guard(&self, mut entry: ConnEntry<F::Connection>) -> PooledConnection<F> {
        entry.use_count += 1;
        PooledConnection {
            entry: Some(entry),
            healthy: true,
            shared: Arc::clone(&self.shared),
        }
    }
}

fn new_entry<C>(conn: C) -> ConnEntry<C> {
    ConnEntry {
        id: Uuid::new_v4(),
        created_at: Instant::now(),
        use_count: 0,
        conn,
    }
}
