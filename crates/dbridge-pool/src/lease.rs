//! Exclusive connection leases.
//!
//! A [`Lease`] is handed to exactly one caller by checkout and returns its
//! connection to the pool when dropped. All operations on the underlying
//! connection go through the lease; nested `transaction` calls reuse the
//! lease in hand and never re-enter checkout.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dbridge_adapter::Adapter;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::connection::{ConnectionHandle, Request};
use crate::error::{Error, ProtocolError};
use crate::log::{CallKind, LogEntry, LogOutcome, LogSink};
use crate::pool::PoolInner;
use crate::transaction::{TransactionContext, TxStatus};

/// Transaction-management calls dispatched to the connection task.
#[derive(Clone, Copy)]
enum TxKind {
    Begin,
    Commit,
    Rollback,
}

impl TxKind {
    fn call_kind(self) -> CallKind {
        match self {
            Self::Begin => CallKind::Begin,
            Self::Commit => CallKind::Commit,
            Self::Rollback => CallKind::Rollback,
        }
    }
}

/// An exclusive lease on one pooled connection.
///
/// Dropping the lease checks the connection back in on every exit path,
/// including panics and early returns. A connection that crashed while
/// leased is discarded at checkin and replaced by the pool.
pub struct Lease<A: Adapter> {
    client_id: u64,
    handle: Option<ConnectionHandle<A>>,
    pool: Weak<PoolInner<A>>,
    options: Arc<A::Options>,
    adapter: Arc<A>,
    log: Option<LogSink>,
    /// Checkout wait, consumed by the first logged operation on this lease.
    pool_time: Mutex<Option<Duration>>,
    ctx: Mutex<TransactionContext>,
}

impl<A: Adapter> Lease<A> {
    pub(crate) fn new(
        client_id: u64,
        handle: ConnectionHandle<A>,
        pool: Weak<PoolInner<A>>,
        options: Arc<A::Options>,
        adapter: Arc<A>,
        log: Option<LogSink>,
        pool_time: Duration,
    ) -> Self {
        Self {
            client_id,
            handle: Some(handle),
            pool,
            options,
            adapter,
            log,
            pool_time: Mutex::new(Some(pool_time)),
            ctx: Mutex::new(TransactionContext::new()),
        }
    }

    /// Id of this lease, used as the client id in crash reports.
    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Id of the leased connection.
    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        self.handle.as_ref().map(ConnectionHandle::id)
    }

    /// Return the connection to the pool.
    ///
    /// Dropping the lease has the same effect; this method only makes the
    /// intent explicit at call sites.
    pub fn checkin(self) {
        drop(self);
    }

    /// Execute a query on the leased connection with the pool's options.
    pub async fn execute(
        &self,
        query: A::Query,
        params: A::Params,
    ) -> Result<A::Output, Error<A::Error>> {
        self.exec(query, params, Arc::clone(&self.options)).await
    }

    /// Execute a query with adapter options overriding the pool defaults.
    pub async fn execute_with(
        &self,
        query: A::Query,
        params: A::Params,
        opts: &A::Options,
    ) -> Result<A::Output, Error<A::Error>> {
        self.exec(query, params, Arc::new(opts.clone())).await
    }

    /// Run `f` with this lease, without any transactional wrapping.
    ///
    /// The return value passes through unchanged and the transaction
    /// context is untouched, inside or outside a transaction.
    pub async fn run<T, F>(&self, f: F) -> T
    where
        F: AsyncFnOnce(&Lease<A>) -> T,
    {
        f(self).await
    }

    pub(crate) fn options(&self) -> &Arc<A::Options> {
        &self.options
    }

    pub(crate) fn ctx(&self) -> &Mutex<TransactionContext> {
        &self.ctx
    }

    pub(crate) async fn begin(&self, opts: &Arc<A::Options>) -> Result<(), Error<A::Error>> {
        self.tx_call(TxKind::Begin, opts).await
    }

    pub(crate) async fn commit(&self, opts: &Arc<A::Options>) -> Result<(), Error<A::Error>> {
        self.tx_call(TxKind::Commit, opts).await
    }

    pub(crate) async fn physical_rollback(
        &self,
        opts: &Arc<A::Options>,
    ) -> Result<(), Error<A::Error>> {
        self.tx_call(TxKind::Rollback, opts).await
    }

    async fn exec(
        &self,
        query: A::Query,
        params: A::Params,
        opts: Arc<A::Options>,
    ) -> Result<A::Output, Error<A::Error>> {
        let pool_time = self.pool_time.lock().take();
        let logging = self.log.is_some();
        let query_repr = logging.then(|| format!("{query:?}"));
        let params_repr = logging.then(|| format!("{params:?}"));
        let decode_query = query.clone();

        let Some(handle) = self.handle.as_ref() else {
            return Err(Error::Protocol(ProtocolError::ConnectionGone));
        };

        let (reply, rx) = oneshot::channel();
        let started = Instant::now();
        let sent = handle
            .request(Request::Execute {
                query,
                params,
                opts: Arc::clone(&opts),
                client: self.client_id,
                reply,
            })
            .await;
        if !sent {
            let error: Error<A::Error> = Error::Protocol(ProtocolError::ConnectionGone);
            self.emit(CallKind::Execute, query_repr, params_repr, pool_time, None, None, &error.to_string());
            return Err(error);
        }
        let replied = rx.await;
        let connection_time = Some(started.elapsed());

        let (result, decode_time) = match replied {
            Ok(Ok(value)) => {
                let decode_started = Instant::now();
                let decoded = self
                    .adapter
                    .decode(&decode_query, value, &opts)
                    .map_err(Error::Driver);
                (decoded, Some(decode_started.elapsed()))
            }
            Ok(Err(error)) => (Err(error), None),
            Err(_) => (Err(Error::Protocol(ProtocolError::ConnectionGone)), None),
        };

        match &result {
            Ok(_) => self.emit_ok(CallKind::Execute, query_repr, params_repr, pool_time, connection_time, decode_time),
            Err(error) => {
                let message = error.to_string();
                self.emit(CallKind::Execute, query_repr, params_repr, pool_time, connection_time, decode_time, &message);
            }
        }
        result
    }

    /// Dispatch one begin/commit/rollback call and log it.
    async fn tx_call(&self, kind: TxKind, opts: &Arc<A::Options>) -> Result<(), Error<A::Error>> {
        let pool_time = self.pool_time.lock().take();

        let Some(handle) = self.handle.as_ref() else {
            return Err(Error::Protocol(ProtocolError::ConnectionGone));
        };

        let (reply, rx) = oneshot::channel();
        let request = match kind {
            TxKind::Begin => Request::Begin {
                opts: Arc::clone(opts),
                client: self.client_id,
                reply,
            },
            TxKind::Commit => Request::Commit {
                opts: Arc::clone(opts),
                client: self.client_id,
                reply,
            },
            TxKind::Rollback => Request::Rollback {
                opts: Arc::clone(opts),
                client: self.client_id,
                reply,
            },
        };

        let started = Instant::now();
        let sent = handle.request(request).await;
        if !sent {
            let error: Error<A::Error> = Error::Protocol(ProtocolError::ConnectionGone);
            self.emit(kind.call_kind(), None, None, pool_time, None, None, &error.to_string());
            return Err(error);
        }
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Protocol(ProtocolError::ConnectionGone)),
        };
        let connection_time = Some(started.elapsed());

        match &result {
            Ok(()) => self.emit_ok(kind.call_kind(), None, None, pool_time, connection_time, None),
            Err(error) => {
                let message = error.to_string();
                self.emit(kind.call_kind(), None, None, pool_time, connection_time, None, &message);
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        call: CallKind,
        query: Option<String>,
        params: Option<String>,
        pool_time: Option<Duration>,
        connection_time: Option<Duration>,
        decode_time: Option<Duration>,
        error: &str,
    ) {
        tracing::debug!(call = %call, error, "operation failed");
        if let Some(sink) = &self.log {
            sink(&LogEntry {
                call,
                query,
                params,
                result: LogOutcome::Error(error.to_string()),
                pool_time,
                connection_time,
                decode_time,
            });
        }
    }

    fn emit_ok(
        &self,
        call: CallKind,
        query: Option<String>,
        params: Option<String>,
        pool_time: Option<Duration>,
        connection_time: Option<Duration>,
        decode_time: Option<Duration>,
    ) {
        tracing::debug!(call = %call, "operation finished");
        if let Some(sink) = &self.log {
            sink(&LogEntry {
                call,
                query,
                params,
                result: LogOutcome::Ok,
                pool_time,
                connection_time,
                decode_time,
            });
        }
    }
}

impl<A: Adapter> Drop for Lease<A> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // A transaction left open by the caller gets a best-effort rollback
        // so the connection returns to the idle set clean. If the shared
        // transaction was already rolled back there is nothing to undo.
        let ctx = self.ctx.get_mut();
        if ctx.depth > 0 && ctx.status == TxStatus::Active {
            tracing::debug!(
                connection = handle.id(),
                client = self.client_id,
                "lease dropped with open transaction, rolling back"
            );
            let (reply, _discard) = oneshot::channel();
            handle.request_detached(Request::Rollback {
                opts: Arc::clone(&self.options),
                client: self.client_id,
                reply,
            });
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.checkin(handle);
        }
    }
}
