pub mod memory_store;
pub mod redis_store;

use std::sync::Arc;

use packet_core::{SchedulerError, SchedulerResult, StoreBackend, StoreConfig};
use packet_domain::CoordinationStore;
use tracing::info;

pub use memory_store::InMemoryStore;
pub use redis_store::RedisStore;

/// 根据配置创建协调存储
///
/// Any failure to reach the backend is reported as `SchedulerUnavailable`.
pub async fn connect_store(config: &StoreConfig) -> SchedulerResult<Arc<dyn CoordinationStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(config).await.map_err(|e| match e {
                SchedulerError::SchedulerUnavailable(_) => e,
                other => SchedulerError::SchedulerUnavailable(other.to_string()),
            })?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("Using in-memory coordination store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
