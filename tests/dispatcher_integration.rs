//! End-to-end scenarios against a throwaway PostgreSQL container (§8).

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use horton::{row_handler, HandlerFailurePolicy};

#[tokio::test]
async fn basic_insert_is_delivered_to_the_registered_handler() {
    let (container, url) = setup_postgres().await;
    let pool = PgPool::connect(&url).await.expect("connect");
    create_accounts_table(&pool).await;

    let config = DispatcherConfig::new(ConnectionOptions::from_pool(pool.clone()).with_prefix(test_prefix("basic")))
        .with_table_listener("accounts", vec![Operation::Insert]);
    let dispatcher = Arc::new(horton::Dispatcher::new(config).expect("valid config"));
    dispatcher.connect(true).await.expect("connect");

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        dispatcher
            .subscribe(
                "accounts",
                Operation::Insert,
                row_handler(move |row| {
                    let received = received.clone();
                    async move {
                        assert_eq!(row.table_name, "accounts");
                        assert_eq!(row.operation, "INSERT");
                        assert!(row.previous_record.is_none());
                        assert!(row.current_record.is_some());
                        received.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;
    }

    sqlx::query("INSERT INTO accounts (name, balance) VALUES ('alice', 100)")
        .execute(&pool)
        .await
        .expect("insert");

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(received.load(Ordering::SeqCst), 1);

    dispatcher.teardown().await.expect("teardown");
    dispatcher.disconnect(Some(0)).await.expect("disconnect");
    drop(container);
}

#[tokio::test]
async fn column_projection_only_carries_listed_columns() {
    let (container, url) = setup_postgres().await;
    let pool = PgPool::connect(&url).await.expect("connect");
    create_accounts_table(&pool).await;

    let config = DispatcherConfig::new(ConnectionOptions::from_pool(pool.clone()).with_prefix(test_prefix("proj")))
        .with_table_listener(
            "accounts",
            TableListenerConfig::new([Operation::Update]).with_record_columns(vec!["balance".into()]),
        );
    let dispatcher = Arc::new(horton::Dispatcher::new(config).expect("valid config"));
    dispatcher.connect(true).await.expect("connect");

    sqlx::query("INSERT INTO accounts (name, balance) VALUES ('bob', 10)")
        .execute(&pool)
        .await
        .expect("seed insert");

    let captured = Arc::new(tokio::sync::Mutex::new(None));
    {
        let captured = captured.clone();
        dispatcher
            .subscribe(
                "accounts",
                Operation::Update,
                row_handler(move |row| {
                    let captured = captured.clone();
                    async move {
                        *captured.lock().await = row.current_record.clone();
                        Ok(())
                    }
                }),
            )
            .await;
    }

    sqlx::query("UPDATE accounts SET balance = 20 WHERE name = 'bob'")
        .execute(&pool)
        .await
        .expect("update");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let record = captured.lock().await.clone().expect("handler fired");
    let obj = record.as_object().expect("object record");
    assert_eq!(obj.keys().collect::<Vec<_>>(), vec!["balance"]);
    assert_eq!(obj["balance"], serde_json::json!(20));

    dispatcher.teardown().await.expect("teardown");
    dispatcher.disconnect(Some(0)).await.expect("disconnect");
    drop(container);
}

#[tokio::test]
async fn wildcard_subscriber_fires_for_every_operation() {
    let (container, url) = setup_postgres().await;
    let pool = PgPool::connect(&url).await.expect("connect");
    create_accounts_table(&pool).await;

    let config = DispatcherConfig::new(ConnectionOptions::from_pool(pool.clone()).with_prefix(test_prefix("wild")))
        .with_table_listener("accounts", vec![Operation::Insert, Operation::Update]);
    let dispatcher = Arc::new(horton::Dispatcher::new(config).expect("valid config"));
    dispatcher.connect(true).await.expect("connect");

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        dispatcher
            .subscribe_wildcard(
                "accounts",
                row_handler(move |_row| {
                    let fired = fired.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;
    }

    sqlx::query("INSERT INTO accounts (name, balance) VALUES ('carol', 5)")
        .execute(&pool)
        .await
        .expect("insert");
    sqlx::query("UPDATE accounts SET balance = 6 WHERE name = 'carol'")
        .execute(&pool)
        .await
        .expect("update");

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 2);

    dispatcher.teardown().await.expect("teardown");
    dispatcher.disconnect(Some(0)).await.expect("disconnect");
    drop(container);
}

#[tokio::test]
async fn failing_handler_preserves_row_under_preserve_policy() {
    let (container, url) = setup_postgres().await;
    let pool = PgPool::connect(&url).await.expect("connect");
    create_accounts_table(&pool).await;

    let mut config =
        DispatcherConfig::new(ConnectionOptions::from_pool(pool.clone()).with_prefix(test_prefix("preserve")))
            .with_table_listener("accounts", vec![Operation::Insert]);
    config.handler_failure_policy = HandlerFailurePolicy::PreserveRowOnFailure;
    let dispatcher = Arc::new(horton::Dispatcher::new(config).expect("valid config"));
    dispatcher.connect(true).await.expect("connect");

    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        dispatcher
            .subscribe(
                "accounts",
                Operation::Insert,
                row_handler(move |_row| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(anyhow::anyhow!("simulated handler failure"))
                    }
                }),
            )
            .await;
    }

    sqlx::query("INSERT INTO accounts (name, balance) VALUES ('dave', 1)")
        .execute(&pool)
        .await
        .expect("insert");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let remaining: (i64,) = sqlx::query_as(&format!(
        "SELECT count(*) FROM \"{}__event_queue\"",
        test_prefix("preserve")
    ))
    .fetch_one(&pool)
    .await
    .expect("count queue rows");
    assert_eq!(remaining.0, 1, "row should remain queued after handler failure");
    assert!(attempts.load(Ordering::SeqCst) >= 1);

    dispatcher.teardown().await.expect("teardown");
    dispatcher.disconnect(Some(0)).await.expect("disconnect");
    drop(container);
}
