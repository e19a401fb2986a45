//! Pool behaviour against a live PostgreSQL server.
//!
//! These tests are ignored by default. Point `DB_HOST` / `DB_PORT` /
//! `DB_NAME` / `DB_USER` / `DB_PASSWORD` at a scratch database and run:
//!
//! ```sh
//! cargo test -p database -- --ignored
//! ```

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use core_config::FromEnv;
use database::DatabaseError;
use database::postgres::{CursorOptions, Pool, PoolConfig, TransactionOptions};
use futures::StreamExt;
use health::HealthStatus;

fn live_config() -> PoolConfig {
    PoolConfig::from_env().expect("valid DB_* environment")
}

async fn live_pool(min_size: u32, max_size: u32) -> Pool {
    let mut config = live_config();
    config.pool.min_size = min_size;
    config.pool.max_size = max_size;
    config.pool.acquire_timeout = Duration::from_secs(5);
    let pool = Pool::new(config).unwrap();
    pool.initialize().await.expect("pool initializes");
    pool
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_initialize_is_idempotent_and_meets_min_size() {
    let pool = live_pool(3, 5).await;
    pool.initialize().await.unwrap();

    assert!(pool.pool_size().await >= 3);
    assert!(pool.pool_size().await <= 5);
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_acquire_fifo_order_under_contention() {
    let pool = Arc::new(live_pool(1, 3).await);

    // Saturate the pool.
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }

    // Queue three waiters in a known order.
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for name in ["A", "B", "C"] {
        let pool = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let client = pool.acquire().await.unwrap();
            order.lock().unwrap().push(name);
            drop(client);
        }));
        // Give each waiter time to join the queue before the next one.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Release in reverse order; FIFO still resumes A, B, C.
    while let Some(client) = held.pop() {
        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_pool_never_exceeds_max_size() {
    let pool = Arc::new(live_pool(1, 3).await);

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let client = pool.acquire().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(client);
        }));
    }

    for _ in 0..20 {
        assert!(pool.pool_size().await <= 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for task in tasks {
        task.await.unwrap();
    }
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_acquire_timeout_when_exhausted() {
    let pool = live_pool(1, 1).await;
    let held = pool.acquire().await.unwrap();

    let started = Instant::now();
    let result = pool.acquire_timeout(Duration::from_millis(200)).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(DatabaseError::AcquireTimeout { .. })));
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(2));

    // The failed waiter left the queue; releasing unblocks normally.
    drop(held);
    let client = pool.acquire().await.unwrap();
    drop(client);
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_query_helpers_round_trip() {
    let pool = live_pool(1, 3).await;
    let table = format!("pool_live_{}", std::process::id());

    pool.execute(
        &format!("CREATE TABLE {table} (id INT PRIMARY KEY, name TEXT)"),
        &[],
        None,
    )
    .await
    .unwrap();

    let inserted = pool
        .execute(
            &format!("INSERT INTO {table} (id, name) VALUES ($1, $2)"),
            &[&1i32, &"first"],
            None,
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    pool.execute_many(
        &format!("INSERT INTO {table} (id, name) VALUES ($1, $2)"),
        &[&[&2i32, &"second"], &[&3i32, &"third"]],
        None,
    )
    .await
    .unwrap();

    let rows = pool
        .fetch(&format!("SELECT id FROM {table} ORDER BY id"), &[], None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);

    let row = pool
        .fetch_row(
            &format!("SELECT name FROM {table} WHERE id = $1"),
            &[&2i32],
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "second");

    let count: Option<i64> = pool
        .fetch_value(&format!("SELECT COUNT(*) FROM {table}"), &[], None)
        .await
        .unwrap();
    assert_eq!(count, Some(3));

    let missing = pool
        .fetch_row(&format!("SELECT * FROM {table} WHERE id = 99"), &[], None)
        .await
        .unwrap();
    assert!(missing.is_none());

    pool.execute(&format!("DROP TABLE {table}"), &[], None)
        .await
        .unwrap();
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_copy_records_to_table() {
    let pool = live_pool(1, 2).await;
    let table = format!("pool_copy_{}", std::process::id());

    pool.execute(
        &format!("CREATE TABLE {table} (id INT, label TEXT)"),
        &[],
        None,
    )
    .await
    .unwrap();

    let records = vec![
        vec![Some("1".to_string()), Some("tab\there".to_string())],
        vec![Some("2".to_string()), None],
    ];
    let copied = pool
        .copy_records_to_table(&table, &["id", "label"], &records, None)
        .await
        .unwrap();
    assert_eq!(copied, 2);

    let label: Option<String> = pool
        .fetch_value(
            &format!("SELECT label FROM {table} WHERE id = 1"),
            &[],
            None,
        )
        .await
        .unwrap();
    assert_eq!(label.as_deref(), Some("tab\there"));

    let null_label = pool
        .fetch_row(&format!("SELECT label FROM {table} WHERE id = 2"), &[], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(null_label.get::<_, Option<String>>(0), None);

    pool.execute(&format!("DROP TABLE {table}"), &[], None)
        .await
        .unwrap();
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_cursor_streams_lazily_and_cleans_up() {
    let pool = live_pool(1, 2).await;

    let stream = pool.cursor(
        "SELECT generate_series(1, 100)".to_string(),
        Vec::new(),
        CursorOptions {
            prefetch: 10,
            ..Default::default()
        },
    );
    futures::pin_mut!(stream);

    let mut seen = 0;
    while let Some(row) = stream.next().await {
        let value: i32 = row.unwrap().get(0);
        seen += 1;
        assert_eq!(value, seen);
        if seen == 25 {
            break; // early exit must release the cursor and transaction
        }
    }
    drop(stream);

    // The connection is back and reusable.
    let value: Option<i32> = pool.fetch_value("SELECT 1", &[], None).await.unwrap();
    assert_eq!(value, Some(1));
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_transaction_commit_and_rollback_on_drop() {
    let pool = live_pool(1, 2).await;
    let table = format!("pool_txn_{}", std::process::id());

    pool.execute(&format!("CREATE TABLE {table} (id INT)"), &[], None)
        .await
        .unwrap();

    // Committed transaction persists.
    {
        let mut client = pool.acquire().await.unwrap();
        let txn = client.transaction(TransactionOptions::default()).await.unwrap();
        txn.execute(&format!("INSERT INTO {table} VALUES (1)"), &[])
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    // Dropped transaction rolls back.
    {
        let mut client = pool.acquire().await.unwrap();
        let txn = client.transaction(TransactionOptions::default()).await.unwrap();
        txn.execute(&format!("INSERT INTO {table} VALUES (2)"), &[])
            .await
            .unwrap();
        // No commit.
    }

    let count: Option<i64> = pool
        .fetch_value(&format!("SELECT COUNT(*) FROM {table}"), &[], None)
        .await
        .unwrap();
    assert_eq!(count, Some(1));

    pool.execute(&format!("DROP TABLE {table}"), &[], None)
        .await
        .unwrap();
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_repeated_query_timeouts_do_not_leak() {
    let pool = live_pool(1, 2).await;

    for _ in 0..5 {
        let result = pool
            .execute("SELECT pg_sleep(5)", &[], Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(DatabaseError::QueryTimeout { .. })));
    }

    let result = pool.health_check().await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert!(result.latency_seconds.is_some());
    pool.close().await;
}

#[tokio::test]
#[ignore] // Requires actual database
async fn test_health_state_machine() {
    let mut config = live_config();
    config.pool.min_size = 1;
    config.pool.max_size = 2;
    let pool = Pool::new(config).unwrap();

    assert_eq!(pool.health_check().await.status, HealthStatus::Initializing);

    pool.initialize().await.unwrap();
    let healthy = pool.health_check().await;
    assert_eq!(healthy.status, HealthStatus::Healthy);
    assert!(healthy.pool_size >= 1);
    assert!(healthy.latency_seconds.unwrap() > 0.0);

    pool.close().await;
    assert_eq!(pool.health_check().await.status, HealthStatus::Initializing);
}
