//! Page-scoped key-value storage.

use hashbrown::HashMap;
use tokio::sync::RwLock;

/// String key-value store shared by every page of the origin.
#[derive(Debug, Default)]
pub struct LocalStorage {
    items: RwLock<HashMap<String, String>>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.items.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.items
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }

    pub async fn remove(&self, key: &str) -> Option<String> {
        self.items.write().await.remove(key)
    }

    pub async fn clear(&self) {
        self.items.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}
