//! # dbridge-testing
//!
//! Test infrastructure for dbridge adapter and pool development.
//!
//! The centerpiece is [`StubAdapter`], a fully scripted
//! [`Adapter`](dbridge_adapter::Adapter) implementation: each callback pops
//! the next scripted [`StubBehavior`] from its queue (defaulting to success
//! when the queue is empty) and records a [`StubCall`] so tests can assert
//! on exactly which physical calls happened, in which order, against which
//! connection generation.
//!
//! ```rust,ignore
//! let adapter = StubAdapter::new();
//! adapter.script_execute(StubBehavior::Rows(vec!["row1".into()]));
//!
//! let pool = Pool::new(adapter.clone(), StubOptions::default(), PoolConfig::new())?;
//! let lease = pool.checkout().await?;
//! let rows = lease.execute("SELECT 1".into(), vec![]).await?;
//!
//! assert_eq!(rows, vec!["row1".to_string()]);
//! assert_eq!(adapter.connect_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dbridge_adapter::{Adapter, Outcome};
use parking_lot::Mutex;
use thiserror::Error;

/// Error type reported by the stub adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StubError(pub String);

impl StubError {
    /// Build a stub error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Adapter options carried through every stub callback.
///
/// The `tag` is recorded alongside begin and execute calls, so tests can
/// verify which options value a per-call override actually delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubOptions {
    /// Free-form marker recorded in [`StubCall`]s.
    pub tag: String,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            tag: "default".into(),
        }
    }
}

impl StubOptions {
    /// Options with the given tag.
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

/// The scripted result of one stub callback invocation.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Succeed; execute returns no rows, transaction calls return unit.
    Succeed,
    /// Succeed with these rows. Only meaningful for execute.
    Rows(Vec<String>),
    /// Report a recoverable driver error.
    Fail(String),
    /// Report a disconnect with this reason.
    Disconnect(String),
    /// Return a value outside the adapter contract.
    Unrecognized(String),
    /// Panic with this message.
    Panic(String),
}

/// One recorded physical call on the stub adapter.
///
/// `generation` is the connection state the call ran against; it increments
/// on every successful connect, so reconnects are observable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubCall {
    /// `connect` was called.
    Connect,
    /// `disconnect` was called with this rendered reason.
    Disconnect {
        /// Rendered disconnect reason.
        reason: String,
    },
    /// `handle_begin` was called.
    Begin {
        /// Connection generation the call ran against.
        generation: u64,
        /// Tag of the options value the call received.
        tag: String,
    },
    /// `handle_commit` was called.
    Commit {
        /// Connection generation the call ran against.
        generation: u64,
    },
    /// `handle_rollback` was called.
    Rollback {
        /// Connection generation the call ran against.
        generation: u64,
    },
    /// `execute` was called.
    Execute {
        /// The query text.
        query: String,
        /// Connection generation the call ran against.
        generation: u64,
        /// Tag of the options value the call received.
        tag: String,
    },
}

#[derive(Default)]
struct StubInner {
    calls: Mutex<Vec<StubCall>>,
    connect_failures: Mutex<VecDeque<StubError>>,
    begin: Mutex<VecDeque<StubBehavior>>,
    commit: Mutex<VecDeque<StubBehavior>>,
    rollback: Mutex<VecDeque<StubBehavior>>,
    execute: Mutex<VecDeque<StubBehavior>>,
    next_generation: AtomicU64,
}

/// A fully scripted adapter.
///
/// Clones share the same scripts and call log, so tests keep one clone for
/// assertions after moving another into the pool.
#[derive(Clone, Default)]
pub struct StubAdapter {
    inner: Arc<StubInner>,
}

impl StubAdapter {
    /// Create a stub adapter with empty scripts.
    ///
    /// With nothing scripted every callback succeeds: connects hand out
    /// fresh generations, transaction calls return unit, executes return no
    /// rows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `connect` to fail with this error.
    pub fn script_connect_failure(&self, error: StubError) {
        self.inner.connect_failures.lock().push_back(error);
    }

    /// Script the next `handle_begin` result.
    pub fn script_begin(&self, behavior: StubBehavior) {
        self.inner.begin.lock().push_back(behavior);
    }

    /// Script the next `handle_commit` result.
    pub fn script_commit(&self, behavior: StubBehavior) {
        self.inner.commit.lock().push_back(behavior);
    }

    /// Script the next `handle_rollback` result.
    pub fn script_rollback(&self, behavior: StubBehavior) {
        self.inner.rollback.lock().push_back(behavior);
    }

    /// Script the next `execute` result.
    pub fn script_execute(&self, behavior: StubBehavior) {
        self.inner.execute.lock().push_back(behavior);
    }

    /// Snapshot of every physical call recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<StubCall> {
        self.inner.calls.lock().clone()
    }

    /// Number of `connect` calls recorded so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.count(|call| matches!(call, StubCall::Connect))
    }

    /// Number of `handle_rollback` calls recorded so far.
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.count(|call| matches!(call, StubCall::Rollback { .. }))
    }

    /// Number of `handle_commit` calls recorded so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.count(|call| matches!(call, StubCall::Commit { .. }))
    }

    fn count(&self, pred: impl Fn(&StubCall) -> bool) -> usize {
        self.inner.calls.lock().iter().filter(|call| pred(call)).count()
    }

    fn record(&self, call: StubCall) {
        tracing::trace!(?call, "stub call");
        self.inner.calls.lock().push(call);
    }

    // The panic arm is the whole point of the script: it lets tests drive
    // the pool's crash isolation.
    #[allow(clippy::panic)]
    fn play<T>(
        queue: &Mutex<VecDeque<StubBehavior>>,
        state: u64,
        on_success: impl FnOnce(Vec<String>) -> T,
    ) -> Outcome<T, u64, StubError> {
        match queue.lock().pop_front().unwrap_or(StubBehavior::Succeed) {
            StubBehavior::Succeed => Outcome::Ok {
                value: on_success(Vec::new()),
                state,
            },
            StubBehavior::Rows(rows) => Outcome::Ok {
                value: on_success(rows),
                state,
            },
            StubBehavior::Fail(message) => Outcome::Error {
                reason: StubError(message),
                state,
            },
            StubBehavior::Disconnect(message) => Outcome::Disconnect {
                reason: StubError(message),
                state,
            },
            StubBehavior::Unrecognized(detail) => Outcome::Unrecognized { detail },
            StubBehavior::Panic(message) => panic!("{message}"),
        }
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    type State = u64;
    type Query = String;
    type Params = Vec<String>;
    type Output = Vec<String>;
    type Error = StubError;
    type Options = StubOptions;

    async fn connect(&self, _opts: &StubOptions) -> Result<u64, StubError> {
        self.record(StubCall::Connect);
        if let Some(error) = self.inner.connect_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(self.inner.next_generation.fetch_add(1, Ordering::Relaxed))
    }

    async fn disconnect(&self, reason: &StubError, _state: u64) {
        self.record(StubCall::Disconnect {
            reason: reason.to_string(),
        });
    }

    async fn handle_begin(
        &self,
        opts: &StubOptions,
        state: u64,
    ) -> Outcome<(), u64, StubError> {
        self.record(StubCall::Begin {
            generation: state,
            tag: opts.tag.clone(),
        });
        Self::play(&self.inner.begin, state, |_| ())
    }

    async fn handle_commit(
        &self,
        _opts: &StubOptions,
        state: u64,
    ) -> Outcome<(), u64, StubError> {
        self.record(StubCall::Commit { generation: state });
        Self::play(&self.inner.commit, state, |_| ())
    }

    async fn handle_rollback(
        &self,
        _opts: &StubOptions,
        state: u64,
    ) -> Outcome<(), u64, StubError> {
        self.record(StubCall::Rollback { generation: state });
        Self::play(&self.inner.rollback, state, |_| ())
    }

    async fn execute(
        &self,
        query: &String,
        _params: Vec<String>,
        opts: &StubOptions,
        state: u64,
    ) -> Outcome<Vec<String>, u64, StubError> {
        self.record(StubCall::Execute {
            query: query.clone(),
            generation: state,
            tag: opts.tag.clone(),
        });
        Self::play(&self.inner.execute, state, |rows| rows)
    }
}
