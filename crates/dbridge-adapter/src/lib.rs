//! # dbridge-adapter
//!
//! The contract a database driver implements to plug into the dbridge
//! connection pool and transaction coordinator.
//!
//! An adapter owns an opaque connection state value ([`Adapter::State`]) and
//! a set of callbacks that each consume the current state and return a tagged
//! [`Outcome`] carrying the next state. The pool never inspects the state; it
//! only threads it through callbacks and reacts to the outcome tag.
//!
//! ## Outcome classification
//!
//! | Returned                      | Pool reaction                               |
//! |-------------------------------|---------------------------------------------|
//! | [`Outcome::Ok`]               | keep connection, return value to caller     |
//! | [`Outcome::Error`]            | keep connection, surface error to caller    |
//! | [`Outcome::Disconnect`]       | tear down and reconnect this connection     |
//! | [`Outcome::Unrecognized`]     | crash the connection, replace it            |
//! | panic inside a callback       | crash the connection, replace it            |
//!
//! A crash is deliberate fail-fast: a misbehaving adapter may have left its
//! state inconsistent, so the connection is discarded rather than reused.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbridge_adapter::{Adapter, Outcome};
//!
//! struct MyDriver;
//!
//! #[async_trait::async_trait]
//! impl Adapter for MyDriver {
//!     type State = MySocket;
//!     // ...
//!     async fn handle_begin(&self, opts: &Self::Options, state: Self::State)
//!         -> Outcome<(), Self::State, Self::Error>
//!     {
//!         match state.send("BEGIN").await {
//!             Ok(()) => Outcome::Ok { value: (), state },
//!             Err(e) if e.is_fatal() => Outcome::Disconnect { reason: e, state },
//!             Err(e) => Outcome::Error { reason: e, state },
//!         }
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::fmt;

/// Tagged result of an adapter callback.
///
/// This is a closed set: anything an adapter cannot express as `Ok`, `Error`
/// or `Disconnect` must be reported as [`Outcome::Unrecognized`], which the
/// pool treats as a protocol violation.
#[derive(Debug)]
pub enum Outcome<T, S, E> {
    /// Success. The connection continues with `state`.
    Ok {
        /// The callback's result, returned to the caller.
        value: T,
        /// The next adapter state.
        state: S,
    },
    /// Recoverable failure. The connection remains usable with `state`.
    Error {
        /// The failure, surfaced to the caller unmodified.
        reason: E,
        /// The next adapter state.
        state: S,
    },
    /// The physical connection is no longer usable.
    ///
    /// The pool invokes [`Adapter::disconnect`] with `state`, surfaces
    /// `reason` to the caller that triggered it, then re-invokes
    /// [`Adapter::connect`] to bring the connection back.
    Disconnect {
        /// The failure, surfaced to the triggering caller only.
        reason: E,
        /// The final state, handed to [`Adapter::disconnect`].
        state: S,
    },
    /// A return value outside the contract.
    ///
    /// Treated as a protocol violation: the connection is crashed and
    /// replaced, and the caller sees `"bad return value: <detail>"`.
    Unrecognized {
        /// Description of the offending value.
        detail: String,
    },
}

impl<T, S, E> Outcome<T, S, E> {
    /// Check whether this outcome leaves the connection usable as-is.
    #[must_use]
    pub fn keeps_connection(&self) -> bool {
        matches!(self, Self::Ok { .. } | Self::Error { .. })
    }
}

/// The capability set a driver implements to participate in the pool.
///
/// All callbacks take the current [`Adapter::State`] by value and return the
/// next state inside the [`Outcome`]; the pool serializes calls per
/// connection, so no callback ever observes concurrent access to one state.
///
/// `#[async_trait]` is used so callback futures are `Send`: each connection
/// runs as an independent task under `tokio::spawn`.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Opaque per-connection state, exclusively owned by the adapter.
    type State: Send + 'static;

    /// Query descriptor passed to [`Adapter::execute`] and shown in logs.
    type Query: fmt::Debug + Clone + Send + 'static;

    /// Parameters passed to [`Adapter::execute`].
    type Params: fmt::Debug + Send + 'static;

    /// Result of a successful execute, after decoding.
    type Output: Send + 'static;

    /// Driver-defined error reason. Passed through the pool unmodified.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Adapter-specific options, passed through to every callback unchanged.
    type Options: Clone + Send + Sync + 'static;

    /// Establish a new connection state.
    ///
    /// Failure is fatal to this connection attempt. There is no retry at
    /// this layer; the pool decides whether to try again with a replacement.
    async fn connect(&self, opts: &Self::Options) -> Result<Self::State, Self::Error>;

    /// Tear down a connection state after a reported disconnect.
    ///
    /// `reason` is the error the adapter returned in
    /// [`Outcome::Disconnect`].
    async fn disconnect(&self, reason: &Self::Error, state: Self::State);

    /// Begin a transaction on this connection.
    async fn handle_begin(
        &self,
        opts: &Self::Options,
        state: Self::State,
    ) -> Outcome<(), Self::State, Self::Error>;

    /// Commit the open transaction on this connection.
    async fn handle_commit(
        &self,
        opts: &Self::Options,
        state: Self::State,
    ) -> Outcome<(), Self::State, Self::Error>;

    /// Roll back the open transaction on this connection.
    async fn handle_rollback(
        &self,
        opts: &Self::Options,
        state: Self::State,
    ) -> Outcome<(), Self::State, Self::Error>;

    /// Execute a query against this connection.
    async fn execute(
        &self,
        query: &Self::Query,
        params: Self::Params,
        opts: &Self::Options,
        state: Self::State,
    ) -> Outcome<Self::Output, Self::State, Self::Error>;

    /// Post-process an execute result on the caller side.
    ///
    /// Runs outside the connection task and is timed separately
    /// (`decode_time` in the log record). The default is the identity.
    fn decode(
        &self,
        query: &Self::Query,
        value: Self::Output,
        opts: &Self::Options,
    ) -> Result<Self::Output, Self::Error> {
        let _ = (query, opts);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestOutcome = Outcome<u32, &'static str, std::io::Error>;

    #[test]
    fn test_ok_and_error_keep_connection() {
        let ok: TestOutcome = Outcome::Ok { value: 1, state: "s" };
        let err: TestOutcome = Outcome::Error {
            reason: std::io::Error::other("oops"),
            state: "s",
        };
        assert!(ok.keeps_connection());
        assert!(err.keeps_connection());
    }

    #[test]
    fn test_disconnect_and_unrecognized_do_not_keep_connection() {
        let disc: TestOutcome = Outcome::Disconnect {
            reason: std::io::Error::other("gone"),
            state: "s",
        };
        let bad: TestOutcome = Outcome::Unrecognized {
            detail: ":oops".into(),
        };
        assert!(!disc.keeps_connection());
        assert!(!bad.keeps_connection());
    }
}
