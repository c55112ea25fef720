use std::time::Duration;

use async_trait::async_trait;
use log::info;
use redis::{Client, aio::ConnectionManager};

use super::DedupStore;
use crate::error::StoreError;

/// Dedup store backed by Redis `SET key 1 NX EX ttl`, so the presence check
/// and the write happen in one server-side step.
#[derive(Clone)]
pub struct RedisDedupStore {
    connection: ConnectionManager,
}

impl RedisDedupStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        info!("Connected to Redis dedup store");
        Ok(Self { connection })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        // EX takes whole seconds, and zero is rejected by the server
        let seconds = ttl.as_secs().max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }
}
