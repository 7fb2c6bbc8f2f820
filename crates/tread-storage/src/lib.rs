//! # Tread Storage
//!
//! Origin-scoped storage shared by the cache worker and its pages.
//!
//! ## Features
//!
//! - **Databases**: named, versioned databases of auto-keyed JSON records
//! - **Local storage**: string key-value pairs
//! - **Mutation queue**: cart/wishlist writes deferred until connectivity
//!
//! ## Architecture
//!
//! ```text
//! OriginStorage
//!     ├── DatabaseFactory
//!     │       └── Database
//!     │               └── ObjectStore
//!     │                       └── id → Record
//!     └── LocalStorage
//!             └── key → value
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

pub mod database;
pub mod local;
pub mod queue;

pub use database::{Database, DatabaseFactory, DatabaseInfo, ObjectStore, Record};
pub use local::LocalStorage;
pub use queue::{MutationKind, MutationQueue, QueuedMutation};

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint error: {0}")]
    Constraint(String),

    #[error("Version error: {0}")]
    Version(String),

    #[error("Data error: {0}")]
    Data(String),
}

/// Everything the origin persists outside Cache Storage.
#[derive(Debug, Clone, Default)]
pub struct OriginStorage {
    pub databases: Arc<DatabaseFactory>,
    pub local: Arc<LocalStorage>,
}

impl OriginStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete every database and clear local storage.
    pub async fn clear_all(&self) -> usize {
        let names: Vec<String> = self
            .databases
            .databases()
            .await
            .into_iter()
            .map(|info| info.name)
            .collect();
        for name in &names {
            self.databases.delete_database(name).await;
        }
        self.local.clear().await;
        info!(databases = names.len(), "Origin storage cleared");
        names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_all() {
        let storage = OriginStorage::new();
        storage.databases.open("a", 1).await.unwrap();
        storage.databases.open("b", 1).await.unwrap();
        storage.local.set("token", "abc").await;

        assert_eq!(storage.clear_all().await, 2);
        assert!(storage.databases.databases().await.is_empty());
        assert_eq!(storage.local.get("token").await, None);
    }
}
