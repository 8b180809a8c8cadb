use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use packet_core::{SchedulerError, SchedulerResult};
use packet_domain::CoordinationStore;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    data: HashMap<String, HashMap<String, String>>,
    expiry: HashMap<String, Instant>,
}

impl Tables {
    fn purge(&mut self, table: &str) {
        if let Some(deadline) = self.expiry.get(table) {
            if Instant::now() >= *deadline {
                self.data.remove(table);
                self.expiry.remove(table);
            }
        }
    }
}

/// 内存协调存储
///
/// Single-process stand-in for the shared store, used by embedded runs and
/// tests. Clones share the same tables. `set_unavailable(true)` makes every
/// call fail with `StoreUnavailable`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> SchedulerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::store_unavailable("in-memory store switched off"));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, table: &str, field: &str) -> SchedulerResult<Option<String>> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        Ok(tables.data.get(table).and_then(|t| t.get(field)).cloned())
    }

    async fn multi_get(
        &self,
        table: &str,
        fields: &[String],
    ) -> SchedulerResult<Vec<Option<String>>> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        let entries = tables.data.get(table);
        Ok(fields
            .iter()
            .map(|f| entries.and_then(|t| t.get(f)).cloned())
            .collect())
    }

    async fn get_all(&self, table: &str) -> SchedulerResult<HashMap<String, String>> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        Ok(tables.data.get(table).cloned().unwrap_or_default())
    }

    async fn set_if_absent(&self, table: &str, field: &str, value: &str) -> SchedulerResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        let entries = tables.data.entry(table.to_string()).or_default();
        if entries.contains_key(field) {
            return Ok(false);
        }
        entries.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn set(&self, table: &str, field: &str, value: &str) -> SchedulerResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        tables
            .data
            .entry(table.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, table: &str, fields: &[String]) -> SchedulerResult<u64> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        let Some(entries) = tables.data.get_mut(table) else {
            return Ok(0);
        };
        let removed = fields
            .iter()
            .filter(|f| entries.remove(f.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn length(&self, table: &str) -> SchedulerResult<u64> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        Ok(tables.data.get(table).map_or(0, |t| t.len() as u64))
    }

    async fn exists(&self, table: &str, field: &str) -> SchedulerResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        Ok(tables
            .data
            .get(table)
            .is_some_and(|t| t.contains_key(field)))
    }

    async fn increment(&self, table: &str, field: &str, delta: i64) -> SchedulerResult<i64> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.purge(table);
        let entries = tables.data.entry(table.to_string()).or_default();
        let current = match entries.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                SchedulerError::query_failure(format!("hash value is not an integer: {raw}"))
            })?,
            None => 0,
        };
        let next = current + delta;
        entries.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, table: &str, ttl: Duration) -> SchedulerResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables.data.contains_key(table) {
            tables
                .expiry
                .insert(table.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn test_set_if_absent_is_exclusive() {
        let store = InMemoryStore::new();
        let attempts = (0..16).map(|i| {
            let store = store.clone();
            async move {
                store
                    .set_if_absent("app[pool]", "7", &format!("worker-{i}"))
                    .await
                    .unwrap()
            }
        });
        let wins = join_all(attempts).await.into_iter().filter(|won| *won).count();
        assert_eq!(wins, 1);
        assert_eq!(store.length("app[pool]").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = InMemoryStore::new();
        store.set("t", "a", "1").await.unwrap();
        store.set("t", "b", "2").await.unwrap();

        assert_eq!(store.get("t", "a").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("t", "z").await.unwrap(), None);
        assert_eq!(
            store
                .multi_get("t", &["b".to_string(), "z".to_string(), "a".to_string()])
                .await
                .unwrap(),
            vec![Some("2".to_string()), None, Some("1".to_string())]
        );
        assert!(store.exists("t", "b").await.unwrap());
        assert_eq!(store.get_all("t").await.unwrap().len(), 2);

        let removed = store
            .delete("t", &["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.length("t").await.unwrap(), 1);
        assert_eq!(store.delete("nope", &["a".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increment() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment("gen", "packet", 1).await.unwrap(), 1);
        assert_eq!(store.increment("gen", "packet", 1).await.unwrap(), 2);
        store.set("gen", "bad", "x").await.unwrap();
        assert!(matches!(
            store.increment("gen", "bad", 1).await,
            Err(SchedulerError::StoreQueryFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_drops_table() {
        let store = InMemoryStore::new();
        store.set("short", "a", "1").await.unwrap();
        store.expire("short", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.length("short").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fault_switch() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.ping().await,
            Err(SchedulerError::StoreUnavailable(_))
        ));
        assert!(store.get("t", "a").await.is_err());
        store.set_unavailable(false);
        assert!(store.ping().await.is_ok());
    }
}
