use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use packet_core::{RetryPolicy, SchedulerError, SchedulerResult, StoreConfig};
use packet_domain::CoordinationStore;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, FromRedisValue, RedisError};
use tracing::{debug, info};

/// Redis 协调存储
///
/// Each command goes through the configured `RetryPolicy`. Reconnection is
/// left to the `ConnectionManager`, so a retried command picks up a fresh
/// connection once the server is back.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    retry: RetryPolicy,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> SchedulerResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            SchedulerError::SchedulerUnavailable(format!("无效的Redis地址 {}: {e}", config.url))
        })?;
        let retry = config.retry_policy();

        let conn = retry
            .run("redis.connect", || {
                let client = client.clone();
                async move {
                    client
                        .get_connection_manager()
                        .await
                        .map_err(map_redis_error)
                }
            })
            .await?;

        let store = Self { conn, retry };
        store.ping().await?;
        info!(url = %config.url, "Redis coordination store connected");
        Ok(store)
    }

    async fn query<T: FromRedisValue>(&self, operation: &str, cmd: Cmd) -> SchedulerResult<T> {
        self.retry
            .run(operation, || {
                let mut conn = self.conn.clone();
                let cmd = cmd.clone();
                async move { cmd.query_async(&mut conn).await.map_err(map_redis_error) }
            })
            .await
    }
}

/// Connection-class failures are `StoreUnavailable`, everything else is a
/// failed query. Both are retried by the policy.
fn map_redis_error(err: RedisError) -> SchedulerError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        SchedulerError::store_unavailable(err.to_string())
    } else {
        SchedulerError::query_failure(err.to_string())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, table: &str, field: &str) -> SchedulerResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(table).arg(field);
        self.query("redis.hget", cmd).await
    }

    async fn multi_get(
        &self,
        table: &str,
        fields: &[String],
    ) -> SchedulerResult<Vec<Option<String>>> {
        // HMGET 不接受空字段列表
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(table).arg(fields);
        self.query("redis.hmget", cmd).await
    }

    async fn get_all(&self, table: &str) -> SchedulerResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(table);
        self.query("redis.hgetall", cmd).await
    }

    async fn set_if_absent(&self, table: &str, field: &str, value: &str) -> SchedulerResult<bool> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(table).arg(field).arg(value);
        self.query("redis.hsetnx", cmd).await
    }

    async fn set(&self, table: &str, field: &str, value: &str) -> SchedulerResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(table).arg(field).arg(value);
        let _: i64 = self.query("redis.hset", cmd).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, fields: &[String]) -> SchedulerResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(table).arg(fields);
        self.query("redis.hdel", cmd).await
    }

    async fn length(&self, table: &str) -> SchedulerResult<u64> {
        let mut cmd = redis::cmd("HLEN");
        cmd.arg(table);
        self.query("redis.hlen", cmd).await
    }

    async fn exists(&self, table: &str, field: &str) -> SchedulerResult<bool> {
        let mut cmd = redis::cmd("HEXISTS");
        cmd.arg(table).arg(field);
        self.query("redis.hexists", cmd).await
    }

    async fn increment(&self, table: &str, field: &str, delta: i64) -> SchedulerResult<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(table).arg(field).arg(delta);
        self.query("redis.hincrby", cmd).await
    }

    async fn expire(&self, table: &str, ttl: Duration) -> SchedulerResult<()> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(table).arg(ttl.as_secs().max(1));
        let _: i64 = self.query("redis.expire", cmd).await?;
        Ok(())
    }

    async fn ping(&self) -> SchedulerResult<()> {
        let response: String = self.query("redis.ping", redis::cmd("PING")).await?;
        if response != "PONG" {
            return Err(SchedulerError::query_failure(format!(
                "Unexpected PING response: {response}"
            )));
        }
        debug!("Redis PING ok");
        Ok(())
    }
}
