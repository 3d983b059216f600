//! Pool lifecycle tests.
//!
//! Checkout exclusivity and timeouts, crash isolation with background
//! replacement, in-place reconnects, close semantics, and the per-operation
//! log records, all driven through the scripted [`StubAdapter`].

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use dbridge_pool::{CallKind, Error, LogEntry, Pool, PoolConfig, ProtocolError};
use dbridge_testing::{StubAdapter, StubBehavior, StubCall, StubError, StubOptions};
use parking_lot::Mutex;

fn pool_of(adapter: &StubAdapter, size: u32) -> Pool<StubAdapter> {
    Pool::new(
        adapter.clone(),
        StubOptions::default(),
        PoolConfig::new().pool_size(size),
    )
    .expect("config is valid")
}

// =============================================================================
// Checkout and checkin
// =============================================================================

#[tokio::test]
async fn test_checkout_hands_out_a_working_connection() {
    let adapter = StubAdapter::new();
    adapter.script_execute(StubBehavior::Rows(vec!["one".into()]));
    let pool = pool_of(&adapter, 1);

    let lease = pool.checkout().await.expect("checkout");
    assert!(lease.connection_id().is_some());

    let rows = lease.execute("SELECT 1".into(), vec![]).await.expect("execute");
    assert_eq!(rows, vec!["one".to_string()]);
}

#[tokio::test]
async fn test_checkout_waits_for_checkin() {
    let adapter = StubAdapter::new();
    let pool = pool_of(&adapter, 1);

    let first = pool.checkout().await.expect("checkout");
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let lease = pool.checkout().await.expect("checkout after checkin");
            lease.execute("later".into(), vec![]).await.expect("execute")
        }
    });

    drop(first);
    waiter.await.expect("waiter finishes");
    // Both callers used the single connection.
    assert_eq!(adapter.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_checkout_times_out_when_pool_is_exhausted() {
    let adapter = StubAdapter::new();
    let timeout = Duration::from_millis(100);
    let pool = Pool::new(
        adapter.clone(),
        StubOptions::default(),
        PoolConfig::new().pool_size(1).checkout_timeout(timeout),
    )
    .expect("config is valid");

    let _held = pool.checkout().await.expect("checkout");
    let starved = pool.checkout().await;
    assert!(matches!(starved, Err(Error::CheckoutTimeout(t)) if t == timeout));
}

#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_overrides_the_configured_one() {
    let adapter = StubAdapter::new();
    let pool = Pool::new(
        adapter.clone(),
        StubOptions::default(),
        PoolConfig::new()
            .pool_size(1)
            .checkout_timeout(Duration::from_secs(60)),
    )
    .expect("config is valid");

    let held = pool.checkout().await.expect("checkout");

    // The caller's bound wins over the pool-wide one.
    let impatient = Duration::from_millis(50);
    let before = tokio::time::Instant::now();
    let starved = pool.checkout_timeout(impatient).await;
    assert!(matches!(starved, Err(Error::CheckoutTimeout(t)) if t == impatient));
    assert!(before.elapsed() < Duration::from_secs(60));

    // A longer per-call bound still succeeds once the connection frees up.
    drop(held);
    pool.checkout_timeout(Duration::from_secs(120))
        .await
        .expect("checkout within per-call bound");
}

#[tokio::test]
async fn test_status_tracks_occupancy() {
    let adapter = StubAdapter::new();
    let pool = pool_of(&adapter, 2);

    let a = pool.checkout().await.expect("checkout");
    let b = pool.checkout().await.expect("checkout");
    let status = pool.status();
    assert_eq!(status.in_use, 2);
    assert_eq!(status.available, 0);
    assert_eq!(status.total, 2);
    assert_eq!(status.max, 2);

    drop(a);
    let status = pool.status();
    assert_eq!(status.in_use, 1);
    assert_eq!(status.available, 1);
    drop(b);
}

#[tokio::test]
async fn test_with_connection_checks_in_on_error() {
    let adapter = StubAdapter::new();
    let pool = pool_of(&adapter, 1);

    let failed: Result<(), _> = pool
        .with_connection(async |_conn| Err(Error::Driver(StubError::new("nope"))))
        .await;
    assert!(failed.is_err());

    // The connection came back despite the error.
    pool.with_connection(async |conn| conn.execute("q".into(), vec![]).await)
        .await
        .expect("second checkout works");
    assert_eq!(adapter.connect_count(), 1);
}

// =============================================================================
// Crash isolation and replacement
// =============================================================================

#[tokio::test]
async fn test_panic_crashes_only_the_offending_connection() {
    let adapter = StubAdapter::new();
    adapter.script_execute(StubBehavior::Panic("kaboom".into()));
    let pool = pool_of(&adapter, 1);

    let lease = pool.checkout().await.expect("checkout");
    let error = lease
        .execute("explode".into(), vec![])
        .await
        .expect_err("panic surfaces as an error");
    assert!(error.is_protocol_error());
    assert_eq!(error.to_string(), "client 1 stopped: ** (panic) kaboom");
    drop(lease);

    // The pool replaced the crashed connection in the background.
    let lease = pool.checkout().await.expect("checkout replacement");
    lease.execute("probe".into(), vec![]).await.expect("execute");
    assert_eq!(adapter.connect_count(), 2);
}

#[tokio::test]
async fn test_bad_return_value_crashes_the_connection() {
    let adapter = StubAdapter::new();
    adapter.script_execute(StubBehavior::Unrecognized(":surprise".into()));
    let pool = pool_of(&adapter, 1);

    let lease = pool.checkout().await.expect("checkout");
    let error = lease
        .execute("q".into(), vec![])
        .await
        .expect_err("bad return surfaces as an error");
    assert_eq!(
        error,
        Error::Protocol(ProtocolError::BadReturn(":surprise".into()))
    );
    drop(lease);

    let lease = pool.checkout().await.expect("checkout replacement");
    lease.execute("probe".into(), vec![]).await.expect("execute");
    assert_eq!(adapter.connect_count(), 2);
}

#[tokio::test]
async fn test_crash_leaves_sibling_connections_untouched() {
    let adapter = StubAdapter::new();
    adapter.script_execute(StubBehavior::Panic("kaboom".into()));
    let pool = pool_of(&adapter, 2);

    let a = pool.checkout().await.expect("checkout");
    let b = pool.checkout().await.expect("checkout");

    let error = a.execute("explode".into(), vec![]).await.expect_err("crash");
    assert!(error.is_protocol_error());

    // The sibling keeps serving as if nothing happened.
    b.execute("steady".into(), vec![]).await.expect("execute");
}

#[tokio::test]
async fn test_disconnect_reconnects_in_place() {
    let adapter = StubAdapter::new();
    adapter.script_execute(StubBehavior::Disconnect("network down".into()));
    let pool = pool_of(&adapter, 1);

    let lease = pool.checkout().await.expect("checkout");
    let error = lease.execute("q".into(), vec![]).await.expect_err("disconnect");
    assert_eq!(error, Error::Disconnect(StubError::new("network down")));

    // Same lease, same connection task, fresh adapter state.
    lease.execute("again".into(), vec![]).await.expect("execute");
    let calls = adapter.calls();
    assert!(matches!(
        calls.as_slice(),
        [
            StubCall::Connect,
            StubCall::Execute { generation: first, .. },
            StubCall::Disconnect { .. },
            StubCall::Connect,
            StubCall::Execute { generation: second, .. },
        ] if *second == *first + 1
    ));
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_retries_until_it_succeeds() {
    let adapter = StubAdapter::new();
    adapter.script_connect_failure(StubError::new("refused"));
    let pool = pool_of(&adapter, 1);

    let lease = pool.checkout().await.expect("checkout after retry");
    lease.execute("q".into(), vec![]).await.expect("execute");
    assert_eq!(adapter.connect_count(), 2);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_fails_new_and_waiting_checkouts() {
    let adapter = StubAdapter::new();
    let pool = pool_of(&adapter, 1);

    let held = pool.checkout().await.expect("checkout");
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.checkout().await.map(|_| ()) }
    });
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    pool.close();
    assert!(pool.is_closed());
    assert_eq!(waiter.await.expect("join"), Err(Error::PoolClosed));
    assert_eq!(pool.checkout().await.map(|_| ()), Err(Error::PoolClosed));

    // The outstanding lease is dropped rather than parked.
    drop(held);
    assert_eq!(pool.status().total, 0);
}

// =============================================================================
// Operation log
// =============================================================================

fn collecting_sink() -> (Arc<Mutex<Vec<LogEntry>>>, dbridge_pool::LogSink) {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let entries = Arc::clone(&entries);
        Arc::new(move |entry: &LogEntry| entries.lock().push(entry.clone())) as _
    };
    (entries, sink)
}

#[tokio::test]
async fn test_log_entries_follow_the_timing_rules() {
    let adapter = StubAdapter::new();
    let (entries, sink) = collecting_sink();
    let pool = Pool::new(
        adapter.clone(),
        StubOptions::default(),
        PoolConfig::new().log(sink),
    )
    .expect("config is valid");

    pool.transaction(async |conn| conn.execute("SELECT 1".into(), vec!["p1".into()]).await)
        .await
        .expect("transaction commits");

    let entries = entries.lock();
    assert_eq!(entries.len(), 3);

    let begin = &entries[0];
    assert_eq!(begin.call, CallKind::Begin);
    assert!(begin.result.is_ok());
    // The checkout wait lands on the first operation of the lease, once.
    assert!(begin.pool_time.is_some());
    assert!(begin.connection_time.is_some());
    assert!(begin.decode_time.is_none());
    assert!(begin.query.is_none());

    let execute = &entries[1];
    assert_eq!(execute.call, CallKind::Execute);
    assert!(execute.pool_time.is_none());
    assert!(execute.connection_time.is_some());
    assert!(execute.decode_time.is_some());
    assert_eq!(execute.query.as_deref(), Some("\"SELECT 1\""));
    assert_eq!(execute.params.as_deref(), Some("[\"p1\"]"));

    let commit = &entries[2];
    assert_eq!(commit.call, CallKind::Commit);
    assert!(commit.pool_time.is_none());
    assert!(commit.result.is_ok());
}

#[tokio::test]
async fn test_log_entry_records_driver_errors() {
    let adapter = StubAdapter::new();
    adapter.script_execute(StubBehavior::Fail("bad query".into()));
    let (entries, sink) = collecting_sink();
    let pool = Pool::new(
        adapter.clone(),
        StubOptions::default(),
        PoolConfig::new().log(sink),
    )
    .expect("config is valid");

    let lease = pool.checkout().await.expect("checkout");
    let _ = lease.execute("broken".into(), vec![]).await;

    let entries = entries.lock();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert!(!entry.result.is_ok());
    // The adapter was reached, so the call was timed; nothing was decoded.
    assert!(entry.connection_time.is_some());
    assert!(entry.decode_time.is_none());
    assert!(entry.pool_time.is_some());
}
