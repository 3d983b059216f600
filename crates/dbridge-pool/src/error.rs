//! Pool and transaction error types.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by pool and transaction operations.
///
/// `E` is the adapter's error type. Adapter-reported reasons
/// ([`Error::Driver`], [`Error::Disconnect`]) are opaque to this layer and
/// passed through unmodified.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum Error<E> {
    /// Adapter-reported recoverable failure. The connection remains usable.
    #[error("driver error: {0}")]
    Driver(E),

    /// Adapter-reported disconnect. The connection was torn down and is
    /// being reconnected in place.
    #[error("disconnected: {0}")]
    Disconnect(E),

    /// Protocol violation by the adapter. The connection was crashed and
    /// will be replaced, never reused.
    #[error(transparent)]
    Protocol(ProtocolError),

    /// A nested `transaction` call was made while the shared transaction is
    /// already rolling back.
    #[error("transaction rolling back")]
    RollingBack,

    /// The transaction was rolled back with this caller-supplied reason.
    ///
    /// Returned by the `transaction` frame that owns the
    /// [`rollback`](crate::Lease::rollback) call.
    #[error("transaction rolled back: {0}")]
    Rollback(E),

    /// The rollback sentinel: an inner frame already rolled the transaction
    /// back, so this outer frame's result is discarded.
    #[error("transaction rolled back")]
    RolledBack,

    /// `rollback` was called with no open transaction.
    #[error("cannot rollback: not inside a transaction")]
    NoTransaction,

    /// No connection became available within the checkout timeout.
    #[error("checkout timed out after {0:?}")]
    CheckoutTimeout(Duration),

    /// The pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

impl<E> Error<E> {
    /// Check whether this error crashed the connection it was issued on.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Check whether this error is one of the rollback outcomes of a
    /// `transaction` call (explicit reason or sentinel).
    #[must_use]
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback(_) | Self::RolledBack)
    }
}

/// A violation of the adapter contract.
///
/// Always fatal to the offending connection: the pool discards it and
/// connects a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// An adapter callback returned a value outside the contract.
    #[error("bad return value: {0}")]
    BadReturn(String),

    /// An adapter callback panicked while serving the given client.
    #[error("client {client} stopped: ** ({kind}) {message}")]
    Fault {
        /// Id of the lease whose call triggered the fault.
        client: u64,
        /// Fault kind, e.g. `panic`.
        kind: String,
        /// Fault message.
        message: String,
    },

    /// The connection stopped before this request could be served.
    #[error("connection is gone")]
    ConnectionGone,
}

/// Result type for pool operations, parameterized over the adapter error.
pub type Result<T, E> = std::result::Result<T, Error<E>>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Error)]
    #[error("{0}")]
    struct Oops(&'static str);

    #[test]
    fn test_display_passes_driver_reason_through() {
        let err: Error<Oops> = Error::Driver(Oops("oops"));
        assert_eq!(err.to_string(), "driver error: oops");
    }

    #[test]
    fn test_fault_message_format() {
        let err: Error<Oops> = Error::Protocol(ProtocolError::Fault {
            client: 7,
            kind: "panic".into(),
            message: "oops".into(),
        });
        assert_eq!(err.to_string(), "client 7 stopped: ** (panic) oops");
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_bad_return_message_format() {
        let err = ProtocolError::BadReturn(":oops".into());
        assert_eq!(err.to_string(), "bad return value: :oops");
    }

    #[test]
    fn test_rollback_classification() {
        assert!(Error::Rollback(Oops("why")).is_rollback());
        assert!(Error::<Oops>::RolledBack.is_rollback());
        assert!(!Error::<Oops>::RollingBack.is_rollback());
    }

    #[test]
    fn test_rolling_back_message() {
        assert_eq!(Error::<Oops>::RollingBack.to_string(), "transaction rolling back");
    }
}
