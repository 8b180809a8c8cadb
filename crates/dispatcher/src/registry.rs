use std::collections::HashSet;
use std::sync::Arc;

use packet_core::{SchedulerError, SchedulerResult, RETRY_COUNT};
use packet_domain::{
    deserialize_task, serialize_task, CoordinationStore, JobIdentity, JobTables, PacketId,
    PacketRef, TableLayout, Task, ID_GENERATOR_FIELD,
};
use tracing::{debug, warn};

/// 任务包注册表：按任务内容分配稳定的任务包id
pub struct PacketRegistry {
    store: Arc<dyn CoordinationStore>,
    layout: TableLayout,
}

impl PacketRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, layout: TableLayout) -> Self {
        Self { store, layout }
    }

    /// 返回任务内容对应的任务包id，不存在则生成
    pub async fn get_or_create_id(
        &self,
        tables: &JobTables,
        serialized: &str,
    ) -> SchedulerResult<PacketId> {
        if let Some(id) = self.lookup(tables, serialized).await? {
            return Ok(id);
        }

        let candidate = self.next_id().await?;
        if self
            .store
            .set_if_absent(&tables.ids, serialized, &candidate.to_string())
            .await?
        {
            debug!(packet_id = candidate, "新任务包id已登记");
            return Ok(PacketId(candidate));
        }

        // 插入失败，说明其他进程已登记了相同内容的任务
        self.lookup(tables, serialized).await?.ok_or_else(|| {
            SchedulerError::query_failure(format!(
                "任务包id登记冲突后无法读取已登记的id: {serialized}"
            ))
        })
    }

    /// 登记任务，内容相同的任务合并为一个任务包
    pub async fn register(
        &self,
        identity: &JobIdentity,
        tasks: &[Task],
    ) -> SchedulerResult<Vec<PacketRef>> {
        let tables = self.layout.job_tables(identity);
        let mut seen = HashSet::new();
        let mut refs = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.iter().enumerate() {
            let serialized = serialize_task(task);
            if !seen.insert(serialized.clone()) {
                continue;
            }
            let id = self.get_or_create_id(&tables, &serialized).await?;
            self.store
                .set(&tables.payload, &id.field(), &serialized)
                .await?;
            refs.push(PacketRef::new(id, index));
        }

        if refs.len() < tasks.len() {
            debug!(
                job = %identity,
                total = tasks.len(),
                unique = refs.len(),
                "重复的任务已合并"
            );
        }
        Ok(refs)
    }

    /// 按任务包id读取任务内容
    pub async fn load_task(&self, tables: &JobTables, id: PacketId) -> SchedulerResult<Option<Task>> {
        let Some(raw) = self.store.get(&tables.payload, &id.field()).await? else {
            return Ok(None);
        };
        match deserialize_task(&raw) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(packet_id = %id, error = %e, "任务内容无法解析");
                Ok(None)
            }
        }
    }

    async fn lookup(&self, tables: &JobTables, serialized: &str) -> SchedulerResult<Option<PacketId>> {
        let raw = self.store.get(&tables.ids, serialized).await?;
        Ok(raw
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|id| *id > 0)
            .map(PacketId))
    }

    /// Mints a candidate id. A non-positive counter is reset and retried.
    async fn next_id(&self) -> SchedulerResult<u64> {
        let table = self.layout.id_generator_table();
        let mut id = self.store.increment(&table, ID_GENERATOR_FIELD, 1).await;

        let mut retries = RETRY_COUNT;
        while !matches!(id, Ok(v) if v > 0) && retries > 0 {
            retries -= 1;
            warn!(?id, "任务包id生成器异常，重置计数器");
            let reset = self.store.set(&table, ID_GENERATOR_FIELD, "0").await;
            id = match reset {
                Ok(()) => self.store.increment(&table, ID_GENERATOR_FIELD, 1).await,
                Err(e) => Err(e),
            };
        }

        match id {
            Ok(v) if v > 0 => Ok(v as u64),
            Ok(v) => Err(SchedulerError::store_unavailable(format!(
                "任务包id生成器返回无效值: {v}"
            ))),
            Err(e) => Err(SchedulerError::store_unavailable(format!(
                "无法读取任务包id生成器: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use packet_infrastructure::InMemoryStore;
    use serde_json::json;

    fn registry(store: &InMemoryStore) -> PacketRegistry {
        PacketRegistry::new(Arc::new(store.clone()), TableLayout::new("test", "node-a"))
    }

    fn identity() -> JobIdentity {
        JobIdentity::new("default", "echo").unwrap()
    }

    #[tokio::test]
    async fn test_same_content_same_id() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        let tables = TableLayout::new("test", "node-a").job_tables(&identity());

        let a = registry
            .get_or_create_id(&tables, &serialize_task(&json!({"a": 1, "b": 2})))
            .await
            .unwrap();
        let b = registry
            .get_or_create_id(&tables, &serialize_task(&json!({"b": 2, "a": 1})))
            .await
            .unwrap();
        let c = registry
            .get_or_create_id(&tables, &serialize_task(&json!({"a": 2})))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_concurrent_registration_is_stable() {
        let store = InMemoryStore::new();
        let tables = TableLayout::new("test", "node-a").job_tables(&identity());
        let serialized = serialize_task(&json!("same-task"));

        let calls = (0..12).map(|_| {
            let registry = registry(&store);
            let tables = tables.clone();
            let serialized = serialized.clone();
            async move { registry.get_or_create_id(&tables, &serialized).await.unwrap() }
        });
        let ids: HashSet<PacketId> = join_all(calls).await.into_iter().collect();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_register_dedupes_and_writes_payload() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        let tasks = vec![json!("a"), json!("b"), json!("a"), json!({"cmd": "true"})];

        let refs = registry.register(&identity(), &tasks).await.unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(
            refs.iter().map(|r| r.task_index).collect::<Vec<_>>(),
            vec![0, 1, 3]
        );

        let tables = TableLayout::new("test", "node-a").job_tables(&identity());
        let task = registry.load_task(&tables, refs[2].id).await.unwrap();
        assert_eq!(task, Some(json!({"cmd": "true"})));
        assert_eq!(registry.load_task(&tables, PacketId(999)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_reset_when_not_positive() {
        let store = InMemoryStore::new();
        let layout = TableLayout::new("test", "node-a");
        store
            .set(&layout.id_generator_table(), ID_GENERATOR_FIELD, "-5")
            .await
            .unwrap();

        let registry = registry(&store);
        let id = registry
            .get_or_create_id(&layout.job_tables(&identity()), "\"x\"")
            .await
            .unwrap();
        assert_eq!(id, PacketId(1));
    }

    #[tokio::test]
    async fn test_store_down_surfaces_error() {
        let store = InMemoryStore::new();
        let registry = registry(&store);
        store.set_unavailable(true);
        let result = registry.register(&identity(), &[json!(1)]).await;
        assert!(matches!(result, Err(SchedulerError::StoreUnavailable(_))));
    }
}
