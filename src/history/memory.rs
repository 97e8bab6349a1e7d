use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{ KvStore, StoreError };

/// Process-local store; nothing outlives the process.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
