//! The document-store trait and dotted-field patch semantics.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// Address of a document: a collection name and a document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    /// Collection the document lives in.
    pub collection: String,
    /// Document id within the collection.
    pub id: String,
}

impl DocPath {
    /// Create a document path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if either part is empty or the
    /// id contains `/`.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> StorageResult<Self> {
        let collection = collection.into();
        let id = id.into();
        if collection.is_empty() || id.is_empty() || id.contains('/') {
            return Err(StorageError::InvalidKey(format!("{collection}/{id}")));
        }
        Ok(Self { collection, id })
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A set of dotted-field updates: `"a.b.c" → value`.
///
/// Ordered so that a patch is applied (and logged) deterministically.
pub type FieldPatch = BTreeMap<String, Value>;

/// Apply a dotted-field patch to a JSON object in place.
///
/// Intermediate objects are created as needed; fields not named in the
/// patch are left untouched. A path segment that collides with an existing
/// non-object value replaces it (the patch wins).
///
/// This lives next to the trait so every backend shares one semantics.
pub fn apply_patch(doc: &mut Value, patch: &FieldPatch) {
    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    for (path, value) in patch {
        let mut node = &mut *doc;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let map = node
                .as_object_mut()
                .expect("node is object by construction");
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value.clone());
                break;
            }
            let child = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !child.is_object() {
                *child = Value::Object(serde_json::Map::new());
            }
            node = child;
        }
    }
}

/// Read a dotted field out of a JSON document.
#[must_use]
pub fn get_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = doc;
    for segment in path.split('.') {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// The external document store.
///
/// Implementations must apply `update_fields`/`merge_fields` atomically per
/// document (readers see pre- or post-state, never a partial patch) and
/// make `compare_and_swap` linearizable per path.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a whole document, or `None` if absent.
    async fn get(&self, path: &DocPath) -> StorageResult<Option<Value>>;

    /// Create or replace a whole document.
    ///
    /// Only used for document creation; steady-state writes go through
    /// [`Self::update_fields`].
    async fn set(&self, path: &DocPath, doc: Value) -> StorageResult<()>;

    /// Apply a dotted-field patch to an existing document.
    ///
    /// Fails with [`StorageError::NotFound`] when the document is absent;
    /// callers decide whether absence means "create" ([`Self::merge_fields`])
    /// or "deliberately deleted, do not resurrect".
    async fn update_fields(&self, path: &DocPath, patch: &FieldPatch) -> StorageResult<()>;

    /// Apply a dotted-field patch, creating the document if absent.
    async fn merge_fields(&self, path: &DocPath, patch: &FieldPatch) -> StorageResult<()>;

    /// Delete a document. Deleting an absent document is a no-op.
    async fn delete(&self, path: &DocPath) -> StorageResult<()>;

    /// List `(id, document)` pairs in a collection.
    async fn list(&self, collection: &str) -> StorageResult<Vec<(String, Value)>>;

    /// Atomically replace a document if its current value matches
    /// `expected` (`None` = must be absent). `new = None` deletes.
    ///
    /// Returns `true` when the swap happened.
    async fn compare_and_swap(
        &self,
        path: &DocPath,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> StorageResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_patch_creates_nested_objects() {
        let mut doc = json!({});
        let mut patch = FieldPatch::new();
        patch.insert("session_doc.whatsapp_web.status".to_string(), json!("connecting"));
        apply_patch(&mut doc, &patch);
        assert_eq!(
            doc,
            json!({"session_doc": {"whatsapp_web": {"status": "connecting"}}})
        );
    }

    #[test]
    fn test_apply_patch_preserves_unrelated_fields() {
        let mut doc = json!({
            "session_doc": {
                "whatsapp_web": {"status": "connecting", "proxy_country": "us"},
                "telegram": {"status": "connected"}
            },
            "owner": "U1"
        });
        let mut patch = FieldPatch::new();
        patch.insert("session_doc.whatsapp_web.status".to_string(), json!("connected"));
        apply_patch(&mut doc, &patch);

        assert_eq!(doc["session_doc"]["whatsapp_web"]["status"], "connected");
        assert_eq!(doc["session_doc"]["whatsapp_web"]["proxy_country"], "us");
        assert_eq!(doc["session_doc"]["telegram"]["status"], "connected");
        assert_eq!(doc["owner"], "U1");
    }

    #[test]
    fn test_apply_patch_overwrites_scalar_in_path() {
        let mut doc = json!({"a": 5});
        let mut patch = FieldPatch::new();
        patch.insert("a.b".to_string(), json!(1));
        apply_patch(&mut doc, &patch);
        assert_eq!(doc, json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_get_field() {
        let doc = json!({"a": {"b": {"c": 7}}});
        assert_eq!(get_field(&doc, "a.b.c"), Some(&json!(7)));
        assert_eq!(get_field(&doc, "a.x"), None);
    }

    #[test]
    fn test_doc_path_validation() {
        assert!(DocPath::new("sessions", "U1:123").is_ok());
        assert!(DocPath::new("", "x").is_err());
        assert!(DocPath::new("sessions", "a/b").is_err());
    }
}
