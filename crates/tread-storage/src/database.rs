//! Named, versioned databases of JSON records.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::debug;

use crate::StorageError;

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub value: JsonValue,
}

// ==================== ObjectStore ====================

/// An auto-keyed object store. Iteration follows insertion order.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    /// Store name.
    pub name: String,

    /// Records by id.
    records: BTreeMap<u64, Record>,

    /// Next auto-increment key.
    next_id: u64,
}

impl ObjectStore {
    /// Create a new object store.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Add a record under a fresh id.
    pub fn add(&mut self, value: JsonValue) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(id, Record { id, value });
        id
    }

    /// Replace an existing record.
    pub fn put(&mut self, id: u64, value: JsonValue) -> Result<(), StorageError> {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.value = value;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("record {id} in {}", self.name))),
        }
    }

    /// Get a record.
    pub fn get(&self, id: u64) -> Option<&Record> {
        self.records.get(&id)
    }

    /// Get all records in insertion order.
    pub fn get_all(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    /// Delete a record.
    pub fn delete(&mut self, id: u64) -> bool {
        self.records.remove(&id).is_some()
    }

    /// Clear all records.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Count records.
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

// ==================== Database ====================

/// A database.
#[derive(Debug, Clone)]
pub struct Database {
    /// Database name.
    pub name: String,

    /// Version.
    pub version: u64,

    /// Object stores.
    stores: HashMap<String, ObjectStore>,
}

impl Database {
    /// Create a new database.
    pub fn new(name: &str, version: u64) -> Self {
        Self {
            name: name.to_string(),
            version,
            stores: HashMap::new(),
        }
    }

    /// Get object store names.
    pub fn object_store_names(&self) -> Vec<&str> {
        self.stores.keys().map(|s| s.as_str()).collect()
    }

    /// Create object store, failing if it exists.
    pub fn create_object_store(&mut self, name: &str) -> Result<(), StorageError> {
        if self.stores.contains_key(name) {
            return Err(StorageError::Constraint(format!(
                "Object store already exists: {}",
                name
            )));
        }
        self.stores.insert(name.to_string(), ObjectStore::new(name));
        Ok(())
    }

    /// Get an object store, creating it on first use.
    pub fn ensure_object_store(&mut self, name: &str) -> &mut ObjectStore {
        self.stores
            .entry(name.to_string())
            .or_insert_with(|| ObjectStore::new(name))
    }

    /// Get object store.
    pub fn object_store(&self, name: &str) -> Option<&ObjectStore> {
        self.stores.get(name)
    }

    /// Get object store mutably.
    pub fn object_store_mut(&mut self, name: &str) -> Option<&mut ObjectStore> {
        self.stores.get_mut(name)
    }
}

// ==================== DatabaseFactory ====================

/// Database info for `databases()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

/// Origin-wide database registry.
#[derive(Debug, Default)]
pub struct DatabaseFactory {
    databases: RwLock<HashMap<String, Database>>,
}

impl DatabaseFactory {
    /// Create a new factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a database, creating or upgrading it. Existing data survives.
    pub async fn open(&self, name: &str, version: u64) -> Result<(), StorageError> {
        let mut databases = self.databases.write().await;

        match databases.get_mut(name) {
            Some(db) if version < db.version => Err(StorageError::Version(format!(
                "Requested version {} is less than current version {}",
                version, db.version
            ))),
            Some(db) => {
                if version > db.version {
                    debug!(db = name, old = db.version, new = version, "Upgrading database");
                    db.version = version;
                }
                Ok(())
            }
            None => {
                debug!(db = name, version, "Creating database");
                databases.insert(name.to_string(), Database::new(name, version));
                Ok(())
            }
        }
    }

    /// Delete a database. Returns whether it existed.
    pub async fn delete_database(&self, name: &str) -> bool {
        self.databases.write().await.remove(name).is_some()
    }

    /// List databases.
    pub async fn databases(&self) -> Vec<DatabaseInfo> {
        let databases = self.databases.read().await;
        let mut infos: Vec<DatabaseInfo> = databases
            .values()
            .map(|db| DatabaseInfo {
                name: db.name.clone(),
                version: db.version,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Snapshot of a database.
    pub async fn get(&self, name: &str) -> Option<Database> {
        self.databases.read().await.get(name).cloned()
    }

    /// Execute an operation on a database.
    pub async fn with_database<F, R>(&self, name: &str, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Database) -> Result<R, StorageError>,
    {
        let mut databases = self.databases.write().await;
        let db = databases
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("Database not found: {}", name)))?;
        f(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_store_auto_increment() {
        let mut store = ObjectStore::new("carts");
        let id1 = store.add(json!({"sku": "a"}));
        let id2 = store.add(json!({"sku": "b"}));
        assert_eq!((id1, id2), (1, 2));
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_object_store_order_and_delete() {
        let mut store = ObjectStore::new("carts");
        for sku in ["a", "b", "c"] {
            store.add(json!({ "sku": sku }));
        }
        assert!(store.delete(2));
        assert!(!store.delete(2));

        let skus: Vec<_> = store.get_all().iter().map(|r| r.value["sku"].clone()).collect();
        assert_eq!(skus, vec![json!("a"), json!("c")]);

        // Ids are never reused after deletion.
        assert_eq!(store.add(json!({"sku": "d"})), 4);
    }

    #[test]
    fn test_object_store_put_missing() {
        let mut store = ObjectStore::new("carts");
        assert!(matches!(store.put(9, json!({})), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_create_object_store_twice() {
        let mut db = Database::new("offline", 1);
        db.create_object_store("carts").unwrap();
        assert!(db.create_object_store("carts").is_err());
        assert_eq!(db.object_store_names(), vec!["carts"]);
    }

    #[tokio::test]
    async fn test_factory_open_keeps_data() {
        let factory = DatabaseFactory::new();
        factory.open("offline", 1).await.unwrap();
        factory
            .with_database("offline", |db| {
                db.ensure_object_store("carts").add(json!({"sku": "a"}));
                Ok(())
            })
            .await
            .unwrap();

        factory.open("offline", 2).await.unwrap();
        let db = factory.get("offline").await.unwrap();
        assert_eq!(db.version, 2);
        assert_eq!(db.object_store("carts").unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_factory_version_downgrade() {
        let factory = DatabaseFactory::new();
        factory.open("offline", 3).await.unwrap();
        assert!(matches!(
            factory.open("offline", 2).await,
            Err(StorageError::Version(_))
        ));
    }

    #[tokio::test]
    async fn test_factory_delete() {
        let factory = DatabaseFactory::new();
        factory.open("offline", 1).await.unwrap();
        assert!(factory.delete_database("offline").await);
        assert!(!factory.delete_database("offline").await);
        assert!(factory.with_database("offline", |_| Ok(())).await.is_err());
    }
}
