//! Offline mutation queue.
//!
//! Cart and wishlist writes that failed while offline are parked here and
//! replayed by the worker's background sync. Entries are removed one by one,
//! only after their own replay succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{DatabaseFactory, StorageError};

/// Database holding the queue.
pub const QUEUE_DATABASE: &str = "offline-mutations";
const QUEUE_VERSION: u64 = 1;

/// Which queue an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Cart,
    Wishlist,
}

impl MutationKind {
    pub fn store_name(&self) -> &'static str {
        match self {
            Self::Cart => "carts",
            Self::Wishlist => "wishlists",
        }
    }
}

/// A deferred write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub kind: MutationKind,
    /// HTTP method of the replayed call.
    pub method: String,
    /// Root-relative API path.
    pub path: String,
    pub body: serde_json::Value,
    /// Bearer token captured when the write was attempted.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

impl QueuedMutation {
    pub fn new(kind: MutationKind, method: &str, path: &str, body: serde_json::Value) -> Self {
        Self {
            kind,
            method: method.to_uppercase(),
            path: path.to_string(),
            body,
            token: None,
            attempts: 0,
            queued_at: Utc::now(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Queue view over the origin's databases.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    databases: Arc<DatabaseFactory>,
}

impl MutationQueue {
    pub fn new(databases: Arc<DatabaseFactory>) -> Self {
        Self { databases }
    }

    async fn ensure_open(&self) -> Result<(), StorageError> {
        self.databases.open(QUEUE_DATABASE, QUEUE_VERSION).await
    }

    /// Append a mutation; returns its id.
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<u64, StorageError> {
        self.ensure_open().await?;
        let kind = mutation.kind;
        let value =
            serde_json::to_value(&mutation).map_err(|e| StorageError::Data(e.to_string()))?;
        let id = self
            .databases
            .with_database(QUEUE_DATABASE, |db| {
                Ok(db.ensure_object_store(kind.store_name()).add(value))
            })
            .await?;
        debug!(?kind, id, path = %mutation.path, "Mutation queued");
        Ok(id)
    }

    /// Pending entries of one kind, oldest first. Undecodable records are skipped.
    pub async fn pending(&self, kind: MutationKind) -> Result<Vec<(u64, QueuedMutation)>, StorageError> {
        let Some(db) = self.databases.get(QUEUE_DATABASE).await else {
            return Ok(Vec::new());
        };
        let Some(store) = db.object_store(kind.store_name()) else {
            return Ok(Vec::new());
        };

        Ok(store
            .get_all()
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record.value) {
                Ok(mutation) => Some((record.id, mutation)),
                Err(e) => {
                    warn!(id = record.id, error = %e, "Skipping undecodable queued mutation");
                    None
                }
            })
            .collect())
    }

    /// Remove an entry after a confirmed replay.
    pub async fn remove(&self, kind: MutationKind, id: u64) -> Result<bool, StorageError> {
        self.databases
            .with_database(QUEUE_DATABASE, |db| {
                Ok(db
                    .object_store_mut(kind.store_name())
                    .is_some_and(|store| store.delete(id)))
            })
            .await
    }

    /// Record a failed replay, keeping the entry for the next sync.
    pub async fn record_failure(&self, kind: MutationKind, id: u64) -> Result<u32, StorageError> {
        self.databases
            .with_database(QUEUE_DATABASE, |db| {
                let store = db
                    .object_store_mut(kind.store_name())
                    .ok_or_else(|| StorageError::NotFound(kind.store_name().to_string()))?;
                let record = store
                    .get(id)
                    .ok_or_else(|| StorageError::NotFound(format!("queued mutation {id}")))?;
                let mut mutation: QueuedMutation = serde_json::from_value(record.value.clone())
                    .map_err(|e| StorageError::Data(e.to_string()))?;
                mutation.attempts += 1;
                let attempts = mutation.attempts;
                let value = serde_json::to_value(&mutation)
                    .map_err(|e| StorageError::Data(e.to_string()))?;
                store.put(id, value)?;
                Ok(attempts)
            })
            .await
    }

    /// Number of pending entries of one kind.
    pub async fn len(&self, kind: MutationKind) -> usize {
        self.databases
            .get(QUEUE_DATABASE)
            .await
            .and_then(|db| db.object_store(kind.store_name()).map(|s| s.count()))
            .unwrap_or(0)
    }
}
