use async_trait::async_trait;
use redis::{ Client, AsyncCommands };

use super::{ KvStore, StoreError };

pub struct RedisKvStore {
    client: Client,
    key_prefix: String,
}

impl RedisKvStore {
    pub fn new(host: &str, key_prefix: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: Client::open(host)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        conn.set::<_, _, ()>(self.key(key), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }
}
