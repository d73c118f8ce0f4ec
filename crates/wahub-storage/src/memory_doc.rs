//! In-memory document store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::doc::{DocPath, DocumentStore, FieldPatch, apply_patch};
use crate::error::{StorageError, StorageResult};

/// An in-memory [`DocumentStore`].
///
/// One `RwLock` over the whole map makes per-document patch application
/// and compare-and-swap trivially atomic, which is all the tests and
/// single-process deployments need.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &DocPath) -> StorageResult<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
            .cloned())
    }

    async fn set(&self, path: &DocPath, doc: Value) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(path.collection.clone())
            .or_default()
            .insert(path.id.clone(), doc);
        Ok(())
    }

    async fn update_fields(&self, path: &DocPath, patch: &FieldPatch) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(&path.collection)
            .and_then(|docs| docs.get_mut(&path.id))
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        apply_patch(doc, patch);
        Ok(())
    }

    async fn merge_fields(&self, path: &DocPath, patch: &FieldPatch) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .entry(path.collection.clone())
            .or_default()
            .entry(path.id.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        apply_patch(doc, patch);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(&path.collection) {
            docs.remove(&path.id);
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> StorageResult<Vec<(String, Value)>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        path: &DocPath,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> StorageResult<bool> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(path.collection.clone()).or_default();
        let current = docs.get(&path.id);
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(doc) => {
                docs.insert(path.id.clone(), doc);
            }
            None => {
                docs.remove(&path.id);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(id: &str) -> DocPath {
        DocPath::new("sessions", id).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryDocumentStore::new();
        let p = path("a");
        store.set(&p, json!({"x": 1})).await.unwrap();
        assert_eq!(store.get(&p).await.unwrap(), Some(json!({"x": 1})));
        store.delete(&p).await.unwrap();
        assert_eq!(store.get(&p).await.unwrap(), None);
        // Deleting again is a no-op
        store.delete(&p).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_fields_requires_document() {
        let store = MemoryDocumentStore::new();
        let mut patch = FieldPatch::new();
        patch.insert("a.b".to_string(), json!(true));
        let err = store.update_fields(&path("missing"), &patch).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_merge_fields_creates_document() {
        let store = MemoryDocumentStore::new();
        let p = path("a");
        let mut patch = FieldPatch::new();
        patch.insert("a.b".to_string(), json!("v"));
        store.merge_fields(&p, &patch).await.unwrap();
        assert_eq!(store.get(&p).await.unwrap(), Some(json!({"a": {"b": "v"}})));
    }

    #[tokio::test]
    async fn test_cas_acquire_semantics() {
        let store = MemoryDocumentStore::new();
        let p = path("owned");

        // Acquire when absent
        assert!(
            store
                .compare_and_swap(&p, None, Some(json!({"owner": "A"})))
                .await
                .unwrap()
        );
        // Second acquire with the same expectation fails
        assert!(
            !store
                .compare_and_swap(&p, None, Some(json!({"owner": "B"})))
                .await
                .unwrap()
        );
        // Takeover with correct expectation succeeds
        let current = json!({"owner": "A"});
        assert!(
            store
                .compare_and_swap(&p, Some(&current), Some(json!({"owner": "B"})))
                .await
                .unwrap()
        );
        assert_eq!(store.get(&p).await.unwrap(), Some(json!({"owner": "B"})));
    }

    #[tokio::test]
    async fn test_list_collection() {
        let store = MemoryDocumentStore::new();
        store.set(&path("a"), json!({"n": 1})).await.unwrap();
        store.set(&path("b"), json!({"n": 2})).await.unwrap();
        let docs = store.list("sessions").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(store.list("empty").await.unwrap().is_empty());
    }
}
