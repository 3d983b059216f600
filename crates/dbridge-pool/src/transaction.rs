//! Nested-transaction coordination.
//!
//! All `transaction` calls on one lease share a single physical transaction.
//! Only the outermost call issues `handle_begin`; only the call that returns
//! the depth to zero with the transaction still healthy issues
//! `handle_commit`; `handle_rollback` runs at most once per top-level
//! transaction no matter how deeply nested the rollback was requested.
//!
//! A rollback unwinds as a typed error value rather than a panic: the frame
//! that owns the [`Lease::rollback`] call returns
//! [`Error::Rollback`](crate::Error::Rollback) with the caller's reason,
//! while every frame further out that finishes afterwards returns the
//! [`Error::RolledBack`](crate::Error::RolledBack) sentinel.

use std::sync::Arc;

use dbridge_adapter::Adapter;

use crate::error::Error;
use crate::lease::Lease;

/// Status of the shared transaction on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStatus {
    /// No transaction open.
    None,
    /// A transaction is open and healthy.
    Active,
    /// The transaction was physically rolled back; frames still open must
    /// unwind without touching the adapter again.
    MarkedRollback,
}

/// Depth and rollback bookkeeping for nested `transaction` calls.
///
/// Owned by the [`Lease`]; every nested call reads and writes it through the
/// lease handle. Depth moves by exactly one per frame enter/exit; status only
/// moves `None -> Active -> MarkedRollback | None`, and `MarkedRollback`
/// sticks until the depth returns to zero.
#[derive(Debug)]
pub(crate) struct TransactionContext {
    pub(crate) depth: u32,
    pub(crate) status: TxStatus,
    /// Depth of the frame a pending rollback unwinds to.
    pub(crate) unwind_to: Option<u32>,
}

impl TransactionContext {
    pub(crate) fn new() -> Self {
        Self {
            depth: 0,
            status: TxStatus::None,
            unwind_to: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

enum Enter {
    /// Outermost frame; `handle_begin` is required.
    Begin,
    /// Nested frame joining the open transaction at this depth.
    Nested(u32),
}

enum Exit {
    /// Outermost frame finishing healthy; `handle_commit` is required.
    Commit,
    /// Nested frame finishing healthy; the value passes through unchanged.
    Pass,
    /// The transaction was already rolled back; yield the sentinel.
    Sentinel,
}

impl<A: Adapter> Lease<A> {
    /// Run `f` inside a transaction on this connection.
    ///
    /// The outermost call begins and commits the physical transaction;
    /// nested calls on the same lease join it without further adapter
    /// calls. Every call resolves to exactly one of:
    ///
    /// - `Ok(value)` — `f` returned `Ok` and, for the outermost frame, the
    ///   commit succeeded;
    /// - `Err(Error::Rollback(reason))` — this frame owned a
    ///   [`rollback`](Self::rollback) call;
    /// - `Err(Error::RolledBack)` — an inner frame rolled the transaction
    ///   back before this frame finished;
    /// - any other `Err` — a fault from `f` or the adapter, re-propagated
    ///   after the transaction was rolled back.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, Error<A::Error>>
    where
        F: AsyncFnOnce(&Lease<A>) -> Result<T, Error<A::Error>>,
    {
        self.tx(Arc::clone(self.options()), f).await
    }

    /// Run `f` inside a transaction with adapter options overriding the
    /// pool defaults for begin/commit/rollback.
    pub async fn transaction_with<T, F>(&self, opts: &A::Options, f: F) -> Result<T, Error<A::Error>>
    where
        F: AsyncFnOnce(&Lease<A>) -> Result<T, Error<A::Error>>,
    {
        self.tx(Arc::new(opts.clone()), f).await
    }

    async fn tx<T, F>(&self, opts: Arc<A::Options>, f: F) -> Result<T, Error<A::Error>>
    where
        F: AsyncFnOnce(&Lease<A>) -> Result<T, Error<A::Error>>,
    {
        let enter = {
            let mut ctx = self.ctx().lock();
            if ctx.depth == 0 {
                Enter::Begin
            } else if ctx.status == TxStatus::MarkedRollback {
                return Err(Error::RollingBack);
            } else {
                ctx.depth += 1;
                Enter::Nested(ctx.depth)
            }
        };

        let my_depth = match enter {
            Enter::Begin => {
                // A begin failure leaves the depth at zero: the connection
                // stays usable and the next transaction starts fresh.
                self.begin(&opts).await?;
                let mut ctx = self.ctx().lock();
                ctx.depth = 1;
                ctx.status = TxStatus::Active;
                1
            }
            Enter::Nested(depth) => depth,
        };

        match f(self).await {
            Ok(value) => {
                let exit = {
                    let mut ctx = self.ctx().lock();
                    ctx.depth -= 1;
                    if ctx.status == TxStatus::MarkedRollback {
                        if ctx.depth == 0 {
                            ctx.reset();
                        }
                        Exit::Sentinel
                    } else if ctx.depth == 0 {
                        Exit::Commit
                    } else {
                        Exit::Pass
                    }
                };
                match exit {
                    Exit::Sentinel => Err(Error::RolledBack),
                    Exit::Pass => Ok(value),
                    Exit::Commit => {
                        let committed = self.commit(&opts).await;
                        self.ctx().lock().reset();
                        committed.map(|()| value)
                    }
                }
            }
            Err(error) => self.unwind(my_depth, &opts, error).await,
        }
    }

    /// Roll back the shared transaction and unwind to the current frame.
    ///
    /// Physically rolls back at most once per top-level transaction, then
    /// returns the error value the caller propagates with `?`; the
    /// `transaction` frame the call was made in catches it and returns
    /// `Err(Error::Rollback(reason))`. If the physical rollback itself
    /// fails, that adapter error is returned instead and unwinds the same
    /// way.
    pub async fn rollback(&self, reason: A::Error) -> Error<A::Error> {
        let rollback_now = {
            let mut ctx = self.ctx().lock();
            if ctx.depth == 0 {
                return Error::NoTransaction;
            }
            ctx.unwind_to = Some(ctx.depth);
            if ctx.status == TxStatus::MarkedRollback {
                false
            } else {
                ctx.status = TxStatus::MarkedRollback;
                true
            }
        };
        if rollback_now {
            let opts = Arc::clone(self.options());
            if let Err(error) = self.physical_rollback(&opts).await {
                return error;
            }
        }
        Error::Rollback(reason)
    }

    /// Handle a frame whose work function returned an error.
    async fn unwind<T>(
        &self,
        my_depth: u32,
        opts: &Arc<A::Options>,
        error: Error<A::Error>,
    ) -> Result<T, Error<A::Error>> {
        // A fault inside the work function is equivalent to an explicit
        // rollback with that fault as the reason: roll back physically
        // (once), then re-propagate the original fault.
        let rollback_now = {
            let mut ctx = self.ctx().lock();
            if ctx.status == TxStatus::MarkedRollback {
                false
            } else {
                ctx.status = TxStatus::MarkedRollback;
                true
            }
        };
        if rollback_now {
            if let Err(rollback_error) = self.physical_rollback(opts).await {
                tracing::warn!(error = %rollback_error, "rollback after fault failed");
            }
        }

        let mut ctx = self.ctx().lock();
        let owned = matches!(error, Error::Rollback(_)) && ctx.unwind_to == Some(my_depth);
        if owned {
            ctx.unwind_to = None;
        }
        ctx.depth -= 1;
        let result = if owned || !matches!(error, Error::Rollback(_)) {
            Err(error)
        } else {
            // A rollback unwinding past its owning frame degrades to the
            // sentinel so only the owner sees the caller-supplied reason.
            Err(Error::RolledBack)
        };
        if ctx.depth == 0 {
            ctx.reset();
        }
        result
    }
}
