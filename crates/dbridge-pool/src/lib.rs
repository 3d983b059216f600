//! Connection pooling and transaction coordination for database adapters.
//!
//! This crate is generic over a [`dbridge_adapter::Adapter`]: the adapter
//! supplies the wire protocol (connect, begin/commit/rollback, execute) and
//! this crate supplies everything around it — a fixed-size pool of
//! connections each owned by its own task, exclusive checkout with FIFO
//! waiters and timeouts, crash isolation with automatic replacement, and
//! nested transactions that share one physical transaction per connection.
//!
//! # Example
//!
//! ```ignore
//! use dbridge_pool::{Pool, PoolConfig};
//!
//! let pool = Pool::new(MyAdapter::new(), my_options, PoolConfig::new().pool_size(8))?;
//!
//! let total = pool
//!     .transaction(async |conn| {
//!         conn.execute(insert_order.clone(), order_params).await?;
//!         conn.execute(count_orders.clone(), vec![]).await
//!     })
//!     .await?;
//! ```
//!
//! # Crash isolation
//!
//! An adapter that panics or returns a value outside its contract crashes
//! only the connection it was running on: the caller gets an
//! [`Error::Protocol`], the other connections keep serving, and the pool
//! connects a replacement in the background.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod error;
mod lease;
mod log;
mod pool;
mod transaction;

pub use config::PoolConfig;
pub use error::{Error, ProtocolError, Result};
pub use lease::Lease;
pub use log::{CallKind, LogEntry, LogOutcome, LogSink};
pub use pool::{Pool, PoolStatus};

pub use dbridge_adapter::{Adapter, Outcome};
