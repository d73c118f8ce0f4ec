//! Opaque session credential material.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The credential file set a protocol session needs to resume without
/// re-pairing.
///
/// The protocol library owns the meaning of the files; everything here
/// treats them as named byte blobs, read and written wholesale. The map is
/// ordered so that serialization and backup comparisons are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBlob {
    files: BTreeMap<String, Vec<u8>>,
}

impl CredentialBlob {
    /// Create an empty blob.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(name.into(), bytes);
    }

    /// Builder-style [`Self::insert`].
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(name, bytes);
        self
    }

    /// Read a file's bytes.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// Iterate `(name, bytes)` pairs in name order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(n, b)| (n.as_str(), b.as_slice()))
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when the blob holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_files_ordered() {
        let blob = CredentialBlob::new()
            .with_file("keys.json", vec![2])
            .with_file("creds.json", vec![1]);
        let names: Vec<&str> = blob.files().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["creds.json", "keys.json"]);
    }

    #[test]
    fn test_blob_round_trips_through_json() {
        let blob = CredentialBlob::new().with_file("creds.json", vec![1, 2, 3]);
        let json = serde_json::to_string(&blob).unwrap();
        let back: CredentialBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }
}
