//! Per-operation timing instrumentation.
//!
//! Every physical adapter call made on behalf of a logical operation (begin,
//! commit, rollback, execute) produces exactly one [`LogEntry`], delivered to
//! the sink configured on [`PoolConfig`](crate::PoolConfig). Nested
//! `transaction` calls that reuse the open transaction produce no entry, as
//! no adapter call happens.
//!
//! One exception: the best-effort rollback issued when a lease is dropped
//! with a transaction still open is detached from any caller, so it emits a
//! `tracing` event but no [`LogEntry`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The logical operation a [`LogEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A top-level transaction begin.
    Begin,
    /// A transaction commit.
    Commit,
    /// A transaction rollback.
    Rollback,
    /// A query execution.
    Execute,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Tagged result of the logged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    /// The operation succeeded.
    Ok,
    /// The operation failed; the rendered error message.
    Error(String),
}

impl LogOutcome {
    /// Check whether the logged operation succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One record per logical operation, emitted once and never mutated.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Which operation this entry describes.
    pub call: CallKind,
    /// Rendered query descriptor. Present only for execute.
    pub query: Option<String>,
    /// Rendered parameters. Present only for execute.
    pub params: Option<String>,
    /// Whether the operation succeeded.
    pub result: LogOutcome,
    /// Time spent waiting for checkout. Present only on the first operation
    /// after a checkout occurred for this lease.
    pub pool_time: Option<Duration>,
    /// Time spent in the connection, including the adapter callback.
    /// Present whenever the adapter was actually invoked.
    pub connection_time: Option<Duration>,
    /// Time spent decoding the result on the caller side. Present only for
    /// execute, the only call with a decode phase.
    pub decode_time: Option<Duration>,
}

/// Sink invoked with each [`LogEntry`].
pub type LogSink = Arc<dyn Fn(&LogEntry) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_kind_display() {
        assert_eq!(CallKind::Begin.to_string(), "begin");
        assert_eq!(CallKind::Commit.to_string(), "commit");
        assert_eq!(CallKind::Rollback.to_string(), "rollback");
        assert_eq!(CallKind::Execute.to_string(), "execute");
    }

    #[test]
    fn test_log_outcome_is_ok() {
        assert!(LogOutcome::Ok.is_ok());
        assert!(!LogOutcome::Error("oops".into()).is_ok());
    }
}
