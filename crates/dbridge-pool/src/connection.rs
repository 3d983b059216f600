//! The per-connection worker task.
//!
//! Each physical connection is owned by exactly one tokio task that holds
//! the adapter state and serializes every operation against it. Requests
//! arrive over an mpsc channel; replies go back over per-request oneshots.
//!
//! The task classifies every adapter callback result:
//!
//! - `Ok`/`Error` keep the connection alive with the returned state.
//! - `Disconnect` tears the state down and reconnects in place; requests
//!   that arrive meanwhile queue on the channel.
//! - `Unrecognized` returns and panics crash the connection: the task stops
//!   immediately, notifies the pool out of band, and is never reused.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dbridge_adapter::{Adapter, Outcome};
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, ProtocolError};

/// Requests served by a connection task.
pub(crate) enum Request<A: Adapter> {
    Begin {
        opts: Arc<A::Options>,
        client: u64,
        reply: oneshot::Sender<Result<(), Error<A::Error>>>,
    },
    Commit {
        opts: Arc<A::Options>,
        client: u64,
        reply: oneshot::Sender<Result<(), Error<A::Error>>>,
    },
    Rollback {
        opts: Arc<A::Options>,
        client: u64,
        reply: oneshot::Sender<Result<(), Error<A::Error>>>,
    },
    Execute {
        query: A::Query,
        params: A::Params,
        opts: Arc<A::Options>,
        client: u64,
        reply: oneshot::Sender<Result<A::Output, Error<A::Error>>>,
    },
}

/// Out-of-band notifications from connection tasks to the pool supervisor.
///
/// Distinct from the caller-facing error: the caller that triggered a crash
/// gets the [`ProtocolError`] synchronously, while the pool learns about it
/// here so it can replace the dead connection.
#[derive(Debug)]
pub(crate) enum PoolEvent {
    /// The connection crashed or failed to reconnect and will never serve
    /// another request.
    Down { id: u64 },
}

/// Pool-side handle to a connection task.
pub(crate) struct ConnectionHandle<A: Adapter> {
    id: u64,
    sender: mpsc::Sender<Request<A>>,
    crashed: Arc<AtomicBool>,
}

impl<A: Adapter> ConnectionHandle<A> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Queue a request on the connection task.
    ///
    /// Returns `false` if the task already stopped.
    pub(crate) async fn request(&self, req: Request<A>) -> bool {
        self.sender.send(req).await.is_ok()
    }

    /// Best-effort request used on the lease drop path.
    pub(crate) fn request_detached(&self, req: Request<A>) {
        let _ = self.sender.try_send(req);
    }
}

/// Connect an adapter state and spawn the task that owns it.
///
/// The returned handle is the only way to reach the connection.
pub(crate) fn spawn<A: Adapter>(
    id: u64,
    adapter: Arc<A>,
    options: Arc<A::Options>,
    state: A::State,
    events: mpsc::UnboundedSender<PoolEvent>,
) -> ConnectionHandle<A> {
    let (sender, rx) = mpsc::channel(32);
    let crashed = Arc::new(AtomicBool::new(false));
    let actor = ConnectionActor {
        id,
        adapter,
        options,
        state: Some(state),
        rx,
        events,
        crashed: crashed.clone(),
        needs_reconnect: false,
    };
    tokio::spawn(actor.run());
    ConnectionHandle { id, sender, crashed }
}

struct ConnectionActor<A: Adapter> {
    id: u64,
    adapter: Arc<A>,
    options: Arc<A::Options>,
    state: Option<A::State>,
    rx: mpsc::Receiver<Request<A>>,
    events: mpsc::UnboundedSender<PoolEvent>,
    crashed: Arc<AtomicBool>,
    needs_reconnect: bool,
}

impl<A: Adapter> ConnectionActor<A> {
    async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            match req {
                Request::Begin { opts, client, reply } => {
                    let adapter = self.adapter.clone();
                    let result = self
                        .apply(client, move |state| async move {
                            adapter.handle_begin(&opts, state).await
                        })
                        .await;
                    let _ = reply.send(result);
                }
                Request::Commit { opts, client, reply } => {
                    let adapter = self.adapter.clone();
                    let result = self
                        .apply(client, move |state| async move {
                            adapter.handle_commit(&opts, state).await
                        })
                        .await;
                    let _ = reply.send(result);
                }
                Request::Rollback { opts, client, reply } => {
                    let adapter = self.adapter.clone();
                    let result = self
                        .apply(client, move |state| async move {
                            adapter.handle_rollback(&opts, state).await
                        })
                        .await;
                    let _ = reply.send(result);
                }
                Request::Execute { query, params, opts, client, reply } => {
                    let adapter = self.adapter.clone();
                    let result = self
                        .apply(client, move |state| async move {
                            adapter.execute(&query, params, &opts, state).await
                        })
                        .await;
                    let _ = reply.send(result);
                }
            }

            // Reconnect after the reply so the triggering caller is not
            // blocked on connection establishment.
            if self.needs_reconnect {
                self.needs_reconnect = false;
                self.reconnect().await;
            }

            if self.crashed.load(Ordering::Acquire) {
                break;
            }
        }
        // Queued requests are dropped here; their callers observe
        // `ProtocolError::ConnectionGone` through the closed reply channel.
        tracing::debug!(connection = self.id, "connection task stopped");
    }

    /// Run one adapter callback against the owned state and classify the
    /// result.
    async fn apply<T, F, Fut>(&mut self, client: u64, call: F) -> Result<T, Error<A::Error>>
    where
        F: FnOnce(A::State) -> Fut,
        Fut: Future<Output = Outcome<T, A::State, A::Error>>,
    {
        let Some(state) = self.state.take() else {
            return Err(Error::Protocol(ProtocolError::ConnectionGone));
        };

        match AssertUnwindSafe(call(state)).catch_unwind().await {
            Ok(Outcome::Ok { value, state }) => {
                self.state = Some(state);
                Ok(value)
            }
            Ok(Outcome::Error { reason, state }) => {
                self.state = Some(state);
                Err(Error::Driver(reason))
            }
            Ok(Outcome::Disconnect { reason, state }) => {
                tracing::warn!(
                    connection = self.id,
                    reason = %reason,
                    "adapter reported disconnect, scheduling reconnect"
                );
                self.adapter.disconnect(&reason, state).await;
                self.needs_reconnect = true;
                Err(Error::Disconnect(reason))
            }
            Ok(Outcome::Unrecognized { detail }) => {
                Err(self.crash(ProtocolError::BadReturn(detail)))
            }
            Err(payload) => Err(self.crash(ProtocolError::Fault {
                client,
                kind: "panic".into(),
                message: panic_message(payload.as_ref()),
            })),
        }
    }

    /// Re-establish the adapter state after a reported disconnect.
    ///
    /// A failed reconnect is terminal for this connection: the pool is told
    /// to replace it, matching crash handling.
    async fn reconnect(&mut self) {
        match self.adapter.connect(&self.options).await {
            Ok(state) => {
                tracing::debug!(connection = self.id, "reconnected");
                self.state = Some(state);
            }
            Err(error) => {
                tracing::warn!(
                    connection = self.id,
                    error = %error,
                    "reconnect failed, stopping connection"
                );
                self.crashed.store(true, Ordering::Release);
                let _ = self.events.send(PoolEvent::Down { id: self.id });
            }
        }
    }

    /// Mark this connection dead after a protocol violation.
    ///
    /// No recovery is attempted on this instance: the adapter state may be
    /// inconsistent, so the task stops and the pool connects a replacement.
    fn crash(&mut self, violation: ProtocolError) -> Error<A::Error> {
        tracing::error!(
            connection = self.id,
            error = %violation,
            "protocol violation, crashing connection"
        );
        self.crashed.store(true, Ordering::Release);
        let _ = self.events.send(PoolEvent::Down { id: self.id });
        Error::Protocol(violation)
    }
}

/// Render a panic payload for the crash report.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::panic_message;

    #[test]
    fn test_panic_message_from_str_and_string() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops");
        assert_eq!(panic_message(payload.as_ref()), "oops");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
