//! Redis 协调存储集成测试
//!
//! 需要可用的 Redis，运行方式:
//! `PACKET_TEST_REDIS_URL=redis://127.0.0.1:6379/15 cargo test -- --ignored`

use std::time::Duration;

use futures::future::join_all;
use packet_core::{now_millis, StoreConfig};
use packet_domain::CoordinationStore;
use packet_infrastructure::RedisStore;

async fn connect() -> RedisStore {
    let url = std::env::var("PACKET_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    let config = StoreConfig {
        url,
        max_retry_attempts: 2,
        retry_min_backoff_ms: 10,
        retry_max_backoff_ms: 50,
        ..Default::default()
    };
    RedisStore::connect(&config).await.expect("redis is reachable")
}

fn unique_table(name: &str) -> String {
    format!("packet-test[{}][{}]", name, now_millis())
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_redis_hash_round_trip() {
    let store = connect().await;
    let table = unique_table("hash");

    store.set(&table, "a", "1").await.unwrap();
    assert!(store.set_if_absent(&table, "b", "2").await.unwrap());
    assert!(!store.set_if_absent(&table, "b", "3").await.unwrap());
    assert_eq!(store.get(&table, "b").await.unwrap(), Some("2".to_string()));
    assert_eq!(
        store
            .multi_get(&table, &["a".to_string(), "zz".to_string()])
            .await
            .unwrap(),
        vec![Some("1".to_string()), None]
    );
    assert!(store.multi_get(&table, &[]).await.unwrap().is_empty());
    assert_eq!(store.length(&table).await.unwrap(), 2);
    assert!(store.exists(&table, "a").await.unwrap());
    assert_eq!(store.get_all(&table).await.unwrap().len(), 2);
    assert_eq!(store.increment(&table, "n", 5).await.unwrap(), 5);
    assert_eq!(
        store
            .delete(&table, &["a".to_string(), "b".to_string(), "n".to_string()])
            .await
            .unwrap(),
        3
    );
    assert_eq!(store.delete(&table, &[]).await.unwrap(), 0);
    store.expire(&table, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_redis_claim_race() {
    let store = connect().await;
    let table = unique_table("race");

    let attempts = (0..20).map(|i| {
        let store = store.clone();
        let table = table.clone();
        async move {
            store
                .set_if_absent(&table, "42", &format!("claim-{i}"))
                .await
                .unwrap()
        }
    });
    let wins = join_all(attempts).await.into_iter().filter(|w| *w).count();
    assert_eq!(wins, 1);
    store.delete(&table, &["42".to_string()]).await.unwrap();
}
