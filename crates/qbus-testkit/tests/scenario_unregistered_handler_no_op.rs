//! Scenario: publishing a `class_name` with no registered handler is a
//! no-op delivery-wise — the row is still claimed and moved to PROCESSED
//! in history, since dispatch with zero matching handlers is success
//! (spec §4.D, §7 "Unregistered class name").
//!
//! requires QBUS_DATABASE_URL; run:
//!   QBUS_DATABASE_URL=postgres://localhost/qbus_test cargo test -p qbus-testkit --test scenario_unregistered_handler_no_op -- --ignored

use std::time::Duration;

use qbus_bus::Publish;
use qbus_runtime::RuntimeConfig;
use qbus_testkit::{test_bus, truncate_queue_tables};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Orphan {
    v: i64,
}

#[tokio::test]
#[ignore = "requires QBUS_DATABASE_URL"]
async fn event_with_no_registered_handler_is_drained_without_delivery() {
    let table = "qbus_scenario_unregistered";
    let config = RuntimeConfig {
        poll_interval: Duration::from_millis(50),
        ..RuntimeConfig::default()
    };
    let (bus, pool) = test_bus(table, config.clone()).await.unwrap();
    truncate_queue_tables(&pool, table).await.unwrap();
    bus.start().await.unwrap();

    bus.post(
        Publish {
            class_name: "Orphan".to_string(),
            search_key1: None,
            search_key2: 1,
            user_token: Uuid::new_v4(),
        },
        &Orphan { v: 1 },
    )
    .await
    .unwrap();

    tokio::time::sleep(config.poll_interval * 4).await;

    assert!(bus.get_in_processing().await.unwrap().is_empty());
    assert!(bus.get_ready(1).await.unwrap().is_empty());

    let (count,): (i64,) = sqlx::query_as(&format!(
        "select count(*) from {table}_history where processing_state = 'PROCESSED' and class_name = 'Orphan'"
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    bus.stop().await.unwrap();
}
