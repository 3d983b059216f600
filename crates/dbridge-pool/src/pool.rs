//! The connection pool.
//!
//! The pool maintains a fixed set of connections, each owned by its own
//! task ([`crate::connection`]). Checkout hands out exclusive [`Lease`]s in
//! arrival order; a supervisor task listens for crash reports and connects
//! replacements so the pool converges back to its configured size.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dbridge_adapter::Adapter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::config::PoolConfig;
use crate::connection::{self, ConnectionHandle, PoolEvent};
use crate::error::Error;
use crate::lease::Lease;
use crate::log::LogSink;

/// A pool of connections driven by one [`Adapter`].
///
/// Cheap to clone; all clones share the same connections. Connections are
/// established in background tasks, so a checkout immediately after
/// [`Pool::new`] waits until the first connect finishes.
pub struct Pool<A: Adapter> {
    inner: Arc<PoolInner<A>>,
}

impl<A: Adapter> Clone for Pool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections sitting idle, ready for checkout.
    pub available: u32,
    /// Connections currently leased out.
    pub in_use: u32,
    /// Replacement or initial connects still in flight.
    pub connecting: u32,
    /// Live connections, leased or idle.
    pub total: u32,
    /// The configured pool size.
    pub max: u32,
}

pub(crate) struct PoolInner<A: Adapter> {
    adapter: Arc<A>,
    options: Arc<A::Options>,
    pool_size: u32,
    checkout_timeout: Duration,
    log: Option<LogSink>,
    closed: AtomicBool,
    next_client_id: AtomicU64,
    next_connection_id: AtomicU64,
    events: mpsc::UnboundedSender<PoolEvent>,
    shared: Mutex<Shared<A>>,
}

struct Shared<A: Adapter> {
    idle: Vec<ConnectionHandle<A>>,
    waiters: VecDeque<oneshot::Sender<ConnectionHandle<A>>>,
    /// Ids of live connections; its size is the pool's `total`.
    live: HashSet<u64>,
    in_use: u32,
    connecting: u32,
}

impl<A: Adapter> Pool<A> {
    /// Create a pool and start connecting.
    ///
    /// Must be called within a tokio runtime. Connections are established
    /// concurrently in the background; a failed connect retries with
    /// backoff until the pool is closed.
    pub fn new(
        adapter: A,
        options: A::Options,
        config: PoolConfig,
    ) -> Result<Self, Error<A::Error>> {
        config.validate()?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            adapter: Arc::new(adapter),
            options: Arc::new(options),
            pool_size: config.pool_size,
            checkout_timeout: config.checkout_timeout,
            log: config.log,
            closed: AtomicBool::new(false),
            next_client_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
            events,
            shared: Mutex::new(Shared {
                idle: Vec::with_capacity(config.pool_size as usize),
                waiters: VecDeque::new(),
                live: HashSet::new(),
                in_use: 0,
                connecting: 0,
            }),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), event_rx));
        for _ in 0..config.pool_size {
            inner.spawn_connect();
        }

        Ok(Self { inner })
    }

    /// Check out an exclusive lease on one connection.
    ///
    /// Waiters are served in arrival order. Fails with
    /// [`Error::CheckoutTimeout`] when no connection frees up within the
    /// configured timeout, and [`Error::PoolClosed`] after [`Pool::close`].
    pub async fn checkout(&self) -> Result<Lease<A>, Error<A::Error>> {
        self.checkout_timeout(self.inner.checkout_timeout).await
    }

    /// Check out a lease, waiting at most `timeout` instead of the
    /// configured [`PoolConfig::checkout_timeout`].
    pub async fn checkout_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Lease<A>, Error<A::Error>> {
        let started = Instant::now();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let mut rx = {
            let mut shared = self.inner.shared.lock();
            loop {
                match shared.idle.pop() {
                    // A connection can crash while idle; its Down report may
                    // still be queued behind us, so just skip it here.
                    Some(handle) if handle.is_crashed() => drop(handle),
                    Some(handle) => {
                        shared.in_use += 1;
                        drop(shared);
                        return Ok(self.lease(handle, started.elapsed()));
                    }
                    None => break,
                }
            }
            let (tx, rx) = oneshot::channel();
            shared.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(handle)) => Ok(self.lease(handle, started.elapsed())),
            // Waiters are only dropped without a grant when the pool closes.
            Ok(Err(_)) => Err(Error::PoolClosed),
            Err(_) => {
                // Closing the receiver first makes the race with a grant
                // deterministic: a handle sent before the close is still
                // delivered, anything later bounces to the next waiter.
                rx.close();
                match rx.try_recv() {
                    Ok(handle) => Ok(self.lease(handle, started.elapsed())),
                    Err(_) => Err(Error::CheckoutTimeout(timeout)),
                }
            }
        }
    }

    /// Check out a connection, run `f` with it, and check it back in.
    ///
    /// The lease returns to the pool on every exit path of `f`.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, Error<A::Error>>
    where
        F: AsyncFnOnce(&Lease<A>) -> Result<T, Error<A::Error>>,
    {
        let lease = self.checkout().await?;
        f(&lease).await
    }

    /// Check out a connection and run `f` inside a transaction on it.
    ///
    /// Shorthand for [`Pool::checkout`] followed by
    /// [`Lease::transaction`].
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, Error<A::Error>>
    where
        F: AsyncFnOnce(&Lease<A>) -> Result<T, Error<A::Error>>,
    {
        let lease = self.checkout().await?;
        lease.transaction(f).await
    }

    /// Close the pool.
    ///
    /// Idle connections are dropped immediately and waiting checkouts fail
    /// with [`Error::PoolClosed`]; leases already handed out keep working
    /// and their connections are dropped at checkin.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("closing pool");
        let (idle, waiters) = {
            let mut shared = self.inner.shared.lock();
            let idle = std::mem::take(&mut shared.idle);
            for handle in &idle {
                shared.live.remove(&handle.id());
            }
            (idle, std::mem::take(&mut shared.waiters))
        };
        // Dropping a handle closes its request channel, which stops the
        // connection task; dropping a waiter fails its checkout.
        drop(idle);
        drop(waiters);
    }

    /// Check whether [`Pool::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot the pool's occupancy counters.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let shared = self.inner.shared.lock();
        PoolStatus {
            available: shared.idle.len() as u32,
            in_use: shared.in_use,
            connecting: shared.connecting,
            total: shared.live.len() as u32,
            max: self.inner.pool_size,
        }
    }

    fn lease(&self, handle: ConnectionHandle<A>, pool_time: Duration) -> Lease<A> {
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(client = client_id, connection = handle.id(), "checked out");
        Lease::new(
            client_id,
            handle,
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.options),
            Arc::clone(&self.inner.adapter),
            self.inner.log.clone(),
            pool_time,
        )
    }
}

impl<A: Adapter> PoolInner<A> {
    /// Return a leased connection to the pool.
    pub(crate) fn checkin(&self, handle: ConnectionHandle<A>) {
        let mut shared = self.shared.lock();
        shared.in_use -= 1;
        if handle.is_crashed() {
            // The supervisor owns the crash accounting and the replacement;
            // the handle just gets discarded here.
            tracing::debug!(connection = handle.id(), "discarding crashed connection at checkin");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            shared.live.remove(&handle.id());
            return;
        }
        Self::grant_or_park(&mut shared, handle);
    }

    /// Register a freshly connected handle.
    fn adopt(&self, handle: ConnectionHandle<A>) {
        let mut shared = self.shared.lock();
        shared.connecting -= 1;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        shared.live.insert(handle.id());
        Self::grant_or_park(&mut shared, handle);
    }

    /// Hand the connection to the longest-waiting checkout, or park it.
    fn grant_or_park(shared: &mut Shared<A>, mut handle: ConnectionHandle<A>) {
        while let Some(waiter) = shared.waiters.pop_front() {
            match waiter.send(handle) {
                Ok(()) => {
                    shared.in_use += 1;
                    return;
                }
                // The waiter timed out or was cancelled; try the next one.
                Err(returned) => handle = returned,
            }
        }
        shared.idle.push(handle);
    }

    /// Start one background connect, retrying until it succeeds or the pool
    /// closes.
    fn spawn_connect(self: &Arc<Self>) {
        self.shared.lock().connecting += 1;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(50);
            loop {
                let Some(inner) = weak.upgrade() else { return };
                if inner.closed.load(Ordering::Acquire) {
                    inner.shared.lock().connecting -= 1;
                    return;
                }
                match inner.adapter.connect(&inner.options).await {
                    Ok(state) => {
                        let id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
                        let handle = connection::spawn(
                            id,
                            Arc::clone(&inner.adapter),
                            Arc::clone(&inner.options),
                            state,
                            inner.events.clone(),
                        );
                        tracing::debug!(connection = id, "connected");
                        inner.adopt(handle);
                        return;
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, delay = ?delay, "connect failed, retrying");
                        drop(inner);
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(5));
                    }
                }
            }
        });
    }
}

/// React to crash reports from connection tasks.
///
/// Holds only a weak reference so an abandoned pool can shut down; the loop
/// ends when every event sender is gone.
async fn supervise<A: Adapter>(
    pool: Weak<PoolInner<A>>,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else { break };
        match event {
            PoolEvent::Down { id } => {
                let known = {
                    let mut shared = inner.shared.lock();
                    shared.idle.retain(|handle| handle.id() != id);
                    shared.live.remove(&id)
                };
                if known && !inner.closed.load(Ordering::Acquire) {
                    tracing::info!(connection = id, "replacing crashed connection");
                    inner.spawn_connect();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_totals_add_up() {
        let status = PoolStatus {
            available: 1,
            in_use: 2,
            connecting: 0,
            total: 3,
            max: 4,
        };
        assert_eq!(status.total, status.available + status.in_use);
    }
}
