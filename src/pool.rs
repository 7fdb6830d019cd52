use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::command::ToArg;
use crate::config::{MaxConnectionsBehavior, PoolConfig, ServerAddress};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pubsub::{MessageReceiver, SubscribeHandler, UnsubscribeHandler};

/// Lease requests buffered while no server addresses are configured.
const BUFFERED_REQUEST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Active,
    Closing,
    Closed,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<Connection>>,
}

struct PoolInner {
    state: PoolState,
    /// Idle stack, most recently added last. Leasing pops from the back:
    /// the freshest connection is the least likely to have died idle.
    idle: Vec<Connection>,
    leased: usize,
    /// Connection-creation attempts currently in flight.
    pending: usize,
    waiters: VecDeque<Waiter>,
    addresses: Vec<ServerAddress>,
    cursor: usize,
    next_waiter_id: u64,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl PoolInner {
    fn total_active(&self) -> usize {
        self.idle.len() + self.leased + self.pending
    }

    fn next_address(&mut self) -> Option<ServerAddress> {
        if self.addresses.is_empty() {
            return None;
        }
        let address = self.addresses[self.cursor % self.addresses.len()].clone();
        self.cursor = (self.cursor + 1) % self.addresses.len();
        Some(address)
    }
}

struct PoolShared {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    // coarse counters for off-task readers
    available: AtomicUsize,
    leased: AtomicUsize,
    /// The at-most-one pub/sub connection; the async mutex serializes all
    /// subscription traffic through the pool.
    pubsub: tokio::sync::Mutex<Option<Connection>>,
}

/// A bounded pool of connections with lease/return, backoff-driven
/// refill, round-robin address rotation and centralized pub/sub.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(mut config: PoolConfig) -> Self {
        if config.max_connections == 0 {
            tracing::warn!("max_connections of 0 makes no sense; using 1");
            config.max_connections = 1;
        }
        if config.min_connections > config.max_connections {
            tracing::warn!(
                min = config.min_connections,
                max = config.max_connections,
                "min_connections exceeds max_connections; clamping"
            );
            config.min_connections = config.max_connections;
        }

        let addresses = config.initial_addresses.clone();
        let shared = Arc::new(PoolShared {
            config,
            inner: Mutex::new(PoolInner {
                state: PoolState::Active,
                idle: Vec::new(),
                leased: 0,
                pending: 0,
                waiters: VecDeque::new(),
                addresses,
                cursor: 0,
                next_waiter_id: 0,
                close_waiters: Vec::new(),
            }),
            available: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            pubsub: tokio::sync::Mutex::new(None),
        });

        shared.refill();
        Self { shared }
    }

    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().unwrap().state
    }

    /// Idle connections currently pooled. Safe from any task.
    pub fn available_connection_count(&self) -> usize {
        self.shared.available.load(Ordering::Relaxed)
    }

    /// Connections currently leased out. Safe from any task.
    pub fn leased_connection_count(&self) -> usize {
        self.shared.leased.load(Ordering::Relaxed)
    }

    /// Borrow a connection, waiting up to `deadline` for one to become
    /// available. An expired waiter is removed and never resurrected.
    pub async fn lease_connection(&self, deadline: Duration) -> Result<Connection> {
        let (waiter_id, mut rx) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != PoolState::Active {
                return Err(Error::PoolClosed);
            }

            // freshest first; silently-dead idles are skipped
            while let Some(connection) = inner.idle.pop() {
                if connection.is_live() {
                    inner.leased += 1;
                    self.shared.sync_counters(&inner);
                    metrics::global().lease_granted();
                    return Ok(connection);
                }
                tracing::debug!(id = connection.id(), "discarding dead idle connection");
            }

            if inner.addresses.is_empty() && inner.waiters.len() >= BUFFERED_REQUEST_LIMIT {
                return Err(Error::NoAvailableConnectionTargets);
            }

            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { id, tx });

            let may_create = match self.shared.config.behavior {
                MaxConnectionsBehavior::Elastic => true,
                MaxConnectionsBehavior::Strict => {
                    inner.total_active() < self.shared.config.max_connections
                }
            };
            if may_create && !inner.addresses.is_empty() {
                inner.pending += 1;
                self.shared.spawn_create();
            }
            self.shared.sync_counters(&inner);
            (id, rx)
        };

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::PoolClosed),
            Err(_elapsed) => {
                let removed = {
                    let mut inner = self.shared.inner.lock().unwrap();
                    match inner.waiters.iter().position(|w| w.id == waiter_id) {
                        Some(at) => {
                            inner.waiters.remove(at);
                            true
                        }
                        None => false,
                    }
                };
                if !removed {
                    // the deadline raced a hand-off; the connection is ours
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                metrics::global().lease_timed_out();
                self.shared.refill();
                Err(Error::TimedOutWaitingForConnection)
            }
        }
    }

    /// Give a leased connection back.
    ///
    /// A pending waiter gets it directly; otherwise it is pooled if there
    /// is room, displaces the oldest idle if not, or is closed.
    pub fn return_connection(&self, connection: Connection) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.leased = inner.leased.saturating_sub(1);

        if !connection.is_live() {
            tracing::debug!(id = connection.id(), "returned connection is no longer live");
            self.shared.sync_counters(&inner);
            drop(inner);
            self.shared.refill();
            return;
        }

        if inner.state != PoolState::Active {
            let finalize = inner.state == PoolState::Closing && inner.leased == 0;
            let close_waiters = if finalize {
                inner.state = PoolState::Closed;
                std::mem::take(&mut inner.close_waiters)
            } else {
                Vec::new()
            };
            self.shared.sync_counters(&inner);
            drop(inner);
            self.shared.spawn_close(connection);
            for waiter in close_waiters {
                let _ = waiter.send(Ok(()));
            }
            if finalize {
                tracing::info!("connection pool closed");
            }
            return;
        }

        let mut returned = Some(connection);
        while let Some(waiter) = inner.waiters.pop_front() {
            let Some(connection) = returned.take() else { break };
            match waiter.tx.send(Ok(connection)) {
                Ok(()) => {
                    inner.leased += 1;
                    self.shared.sync_counters(&inner);
                    metrics::global().lease_granted();
                    return;
                }
                // that waiter gave up; recover the connection and try the next
                Err(rejected) => returned = rejected.ok(),
            }
        }
        let Some(connection) = returned else { return };

        let has_room = match self.shared.config.behavior {
            MaxConnectionsBehavior::Elastic => {
                inner.idle.len() < self.shared.config.max_connections
            }
            MaxConnectionsBehavior::Strict => {
                inner.total_active() < self.shared.config.max_connections
            }
        };
        if has_room {
            inner.idle.push(connection);
            self.shared.sync_counters(&inner);
        } else if !inner.idle.is_empty() {
            // keep the freshest warm: evict the oldest idle instead
            let evicted = inner.idle.remove(0);
            inner.idle.push(connection);
            self.shared.sync_counters(&inner);
            drop(inner);
            self.shared.spawn_close(evicted);
        } else {
            self.shared.sync_counters(&inner);
            drop(inner);
            self.shared.spawn_close(connection);
        }
    }

    /// Replace the server address set, reset the rotation cursor, and
    /// kick off creations for requests buffered while no addresses were
    /// known.
    pub fn update_connection_addresses(&self, addresses: Vec<ServerAddress>) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            tracing::info!(count = addresses.len(), "updating connection addresses");
            inner.addresses = addresses;
            inner.cursor = 0;

            if inner.state != PoolState::Active || inner.addresses.is_empty() {
                return;
            }
            let uncovered = inner.waiters.len().saturating_sub(inner.pending);
            for _ in 0..uncovered {
                inner.pending += 1;
                self.shared.spawn_create();
            }
        }
        self.shared.refill();
    }

    /// Subscribe to channels through the pool's single pub/sub
    /// connection, promoting one from the pool on first use.
    pub async fn subscribe<I>(
        &self,
        channels: I,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
    ) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let mut slot = self.shared.pubsub.lock().await;
        let (connection, fresh) = self.pubsub_connection(&mut slot).await?;
        let result = connection
            .subscribe(channels, on_message, on_subscribe, on_unsubscribe)
            .await;
        if result.is_err() && fresh {
            self.release_pubsub(&mut slot);
        }
        result
    }

    /// Pattern flavor of [`subscribe`](Self::subscribe).
    pub async fn psubscribe<I>(
        &self,
        patterns: I,
        on_message: MessageReceiver,
        on_subscribe: Option<SubscribeHandler>,
        on_unsubscribe: Option<UnsubscribeHandler>,
    ) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let mut slot = self.shared.pubsub.lock().await;
        let (connection, fresh) = self.pubsub_connection(&mut slot).await?;
        let result = connection
            .psubscribe(patterns, on_message, on_subscribe, on_unsubscribe)
            .await;
        if result.is_err() && fresh {
            self.release_pubsub(&mut slot);
        }
        result
    }

    /// Unsubscribe from channels (empty = all). When the final
    /// unsubscribe reports count 0 the pub/sub connection is reset and
    /// returned to the pool.
    pub async fn unsubscribe<I>(&self, channels: I) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let mut slot = self.shared.pubsub.lock().await;
        let Some(connection) = slot.clone() else {
            return Ok(0);
        };
        let result = connection.unsubscribe(channels).await;
        self.settle_pubsub(&mut slot, &result);
        result
    }

    /// Pattern flavor of [`unsubscribe`](Self::unsubscribe).
    pub async fn punsubscribe<I>(&self, patterns: I) -> Result<i64>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        let mut slot = self.shared.pubsub.lock().await;
        let Some(connection) = slot.clone() else {
            return Ok(0);
        };
        let result = connection.punsubscribe(patterns).await;
        self.settle_pubsub(&mut slot, &result);
        result
    }

    /// Close the pool: idle connections close, waiters fail with
    /// `PoolClosed`, new leases are rejected. With leases still out the
    /// close future reports `PoolHasActiveConnections`; the pool finishes
    /// closing as they come back, and a later call then resolves clean.
    pub async fn close(&self) -> Result<()> {
        let rx = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                PoolState::Closed => return Ok(()),
                PoolState::Closing => {
                    let (tx, rx) = oneshot::channel();
                    inner.close_waiters.push(tx);
                    rx
                }
                PoolState::Active => {
                    inner.state = PoolState::Closing;
                    let idle = std::mem::take(&mut inner.idle);
                    for waiter in inner.waiters.drain(..) {
                        let _ = waiter.tx.send(Err(Error::PoolClosed));
                    }
                    let has_leases = inner.leased > 0;
                    if !has_leases {
                        inner.state = PoolState::Closed;
                    }
                    self.shared.sync_counters(&inner);
                    drop(inner);

                    for connection in idle {
                        self.shared.spawn_close(connection);
                    }
                    return if has_leases {
                        tracing::debug!("pool closing with connections still leased");
                        Err(Error::PoolHasActiveConnections)
                    } else {
                        tracing::info!("connection pool closed");
                        Ok(())
                    };
                }
            }
        };
        rx.await.unwrap_or(Ok(()))
    }

    /// The held pub/sub connection, promoting a leased one on first use.
    async fn pubsub_connection(
        &self,
        slot: &mut Option<Connection>,
    ) -> Result<(Connection, bool)> {
        if slot.as_ref().is_some_and(|c| !c.is_live())
            && let Some(dead) = slot.take()
        {
            tracing::debug!(id = dead.id(), "pub/sub connection died; discarding");
            self.return_connection(dead);
        }

        match slot.as_ref() {
            Some(connection) => Ok((connection.clone(), false)),
            None => {
                let connection = self
                    .lease_connection(self.shared.config.retry.clamped_timeout())
                    .await?;
                connection.set_allow_subscriptions(true);
                *slot = Some(connection.clone());
                Ok((connection, true))
            }
        }
    }

    fn settle_pubsub(&self, slot: &mut Option<Connection>, result: &Result<i64>) {
        match result {
            Ok(0) => self.release_pubsub(slot),
            Ok(_) => {}
            Err(_) => {
                if slot.as_ref().is_some_and(|c| !c.is_live()) {
                    self.release_pubsub(slot);
                }
            }
        }
    }

    fn release_pubsub(&self, slot: &mut Option<Connection>) {
        if let Some(connection) = slot.take() {
            connection.set_allow_subscriptions(false);
            self.return_connection(connection);
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("state", &self.state())
            .field("available", &self.available_connection_count())
            .field("leased", &self.leased_connection_count())
            .finish()
    }
}

impl PoolShared {
    fn sync_counters(&self, inner: &PoolInner) {
        self.available.store(inner.idle.len(), Ordering::Relaxed);
        self.leased.store(inner.leased, Ordering::Relaxed);
    }

    /// Top the pool back up to `min_connections`. No-op unless `Active`
    /// with known addresses.
    fn refill(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != PoolState::Active || inner.addresses.is_empty() {
            return;
        }
        let mut need = self
            .config
            .min_connections
            .saturating_sub(inner.total_active());
        while need > 0 {
            inner.pending += 1;
            self.spawn_create();
            need -= 1;
        }
    }

    /// Run one connection-creation attempt with retries. The caller has
    /// already counted it in `pending`; this task is responsible for
    /// decrementing exactly once, via `deliver` or on giving up.
    ///
    /// The task holds only a weak reference so an abandoned pool can
    /// drop freely mid-retry.
    fn spawn_create(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut delay = Duration::ZERO;
            loop {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                let Some(shared) = weak.upgrade() else { return };

                let address = {
                    let mut inner = shared.inner.lock().unwrap();
                    if inner.state != PoolState::Active {
                        inner.pending = inner.pending.saturating_sub(1);
                        return;
                    }
                    match inner.next_address() {
                        Some(address) => address,
                        None => {
                            inner.pending = inner.pending.saturating_sub(1);
                            return;
                        }
                    }
                };

                let config = shared.config.factory.for_address(address.clone());
                match Connection::connect(config).await {
                    Ok(connection) => {
                        shared.watch_closure(&connection);
                        shared.deliver(connection);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(address = %address, error = %e, "connection attempt failed");
                        delay = if delay.is_zero() {
                            shared.config.retry.initial_delay
                        } else {
                            shared.config.retry.next_delay(delay)
                        };

                        let mut inner = shared.inner.lock().unwrap();
                        let others_pending = inner.pending.saturating_sub(1);
                        let wanted = inner.state == PoolState::Active
                            && (inner.waiters.len() > others_pending
                                || inner.total_active().saturating_sub(1)
                                    < shared.config.min_connections);
                        let within_budget =
                            started.elapsed() + delay <= shared.config.retry.clamped_timeout();
                        if !wanted || !within_budget {
                            inner.pending = inner.pending.saturating_sub(1);
                            tracing::debug!(address = %address, "giving up on connection attempt");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Hand a freshly created connection to a waiter, the idle stack, or
    /// close it if neither wants it.
    fn deliver(self: &Arc<Self>, connection: Connection) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending = inner.pending.saturating_sub(1);

        if inner.state != PoolState::Active {
            drop(inner);
            self.spawn_close(connection);
            return;
        }

        let mut created = Some(connection);
        while let Some(waiter) = inner.waiters.pop_front() {
            let Some(connection) = created.take() else { break };
            match waiter.tx.send(Ok(connection)) {
                Ok(()) => {
                    inner.leased += 1;
                    self.sync_counters(&inner);
                    metrics::global().lease_granted();
                    return;
                }
                Err(rejected) => created = rejected.ok(),
            }
        }
        let Some(connection) = created else { return };

        if inner.idle.len() < self.config.max_connections {
            inner.idle.push(connection);
            self.sync_counters(&inner);
        } else {
            drop(inner);
            self.spawn_close(connection);
        }
    }

    /// Drop the connection from the idle stack when it closes underneath
    /// us, and top the pool back up.
    fn watch_closure(self: &Arc<Self>, connection: &Connection) {
        let weak = Arc::downgrade(self);
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let Some(shared) = weak.upgrade() else { return };
            {
                let mut inner = shared.inner.lock().unwrap();
                let before = inner.idle.len();
                inner.idle.retain(|c| c.id() != watched.id());
                if inner.idle.len() != before {
                    tracing::debug!(id = watched.id(), "idle connection closed; dropped from pool");
                }
                shared.sync_counters(&inner);
            }
            shared.refill();
        });
    }

    fn spawn_close(&self, connection: Connection) {
        tokio::spawn(async move {
            let _ = connection.close().await;
        });
    }
}
