use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use packet_core::SchedulerResult;

/// 协调存储接口：以表名区分的哈希表，所有跨进程状态都经由这里
///
/// Every operation touches a single key and is atomic on its own. Nothing
/// here assumes multi-key transactions.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn get(&self, table: &str, field: &str) -> SchedulerResult<Option<String>>;

    /// Values in the same order as `fields`.
    async fn multi_get(
        &self,
        table: &str,
        fields: &[String],
    ) -> SchedulerResult<Vec<Option<String>>>;

    async fn get_all(&self, table: &str) -> SchedulerResult<HashMap<String, String>>;

    /// Writes only when the field is absent. Returns whether this call wrote it.
    async fn set_if_absent(&self, table: &str, field: &str, value: &str) -> SchedulerResult<bool>;

    async fn set(&self, table: &str, field: &str, value: &str) -> SchedulerResult<()>;

    /// Returns the number of fields actually removed.
    async fn delete(&self, table: &str, fields: &[String]) -> SchedulerResult<u64>;

    async fn length(&self, table: &str) -> SchedulerResult<u64>;

    async fn exists(&self, table: &str, field: &str) -> SchedulerResult<bool>;

    /// Atomically adds `delta` and returns the new value.
    async fn increment(&self, table: &str, field: &str, delta: i64) -> SchedulerResult<i64>;

    async fn expire(&self, table: &str, ttl: Duration) -> SchedulerResult<()>;

    async fn ping(&self) -> SchedulerResult<()>;
}
