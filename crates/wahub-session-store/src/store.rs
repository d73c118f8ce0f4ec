//! The session blob store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wahub_core::{CredentialBlob, SessionKey};
use wahub_secrets::{SecretStore, names};
use wahub_storage::ObjectStore;

use crate::crypto::BlobCipher;
use crate::error::{SessionStoreError, SessionStoreResult};

/// Where blobs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Process filesystem only.
    Local,
    /// Object store only.
    Cloud,
    /// Filesystem primary plus periodic encrypted backup.
    #[default]
    Hybrid,
}

/// Session store settings.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Storage mode.
    pub mode: StoreMode,
    /// Local blob directory.
    pub root: PathBuf,
    /// Hybrid backup cadence.
    pub backup_interval: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            root: PathBuf::from("./sessions"),
            backup_interval: Duration::from_secs(300),
        }
    }
}

/// Durable storage for per-session credential blobs.
pub struct SessionStore {
    config: SessionStoreConfig,
    objects: Option<Arc<dyn ObjectStore>>,
    secrets: Arc<SecretStore>,
    locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    dirty: std::sync::Mutex<HashSet<SessionKey>>,
}

impl SessionStore {
    /// Create a store.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::ObjectStoreMissing`] when the mode
    /// needs an object store and none was given.
    pub fn new(
        config: SessionStoreConfig,
        objects: Option<Arc<dyn ObjectStore>>,
        secrets: Arc<SecretStore>,
    ) -> SessionStoreResult<Self> {
        if config.mode != StoreMode::Local && objects.is_none() {
            return Err(SessionStoreError::ObjectStoreMissing);
        }
        Ok(Self {
            config,
            objects,
            secrets,
            locks: DashMap::new(),
            dirty: std::sync::Mutex::new(HashSet::new()),
        })
    }

    fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn local_dir(&self, key: &SessionKey) -> PathBuf {
        let (user, phone) = key.path_segments();
        self.config.root.join(user).join(phone)
    }

    fn object_prefix(key: &SessionKey) -> String {
        let (user, phone) = key.path_segments();
        format!("sessions/{user}/{phone}/")
    }

    async fn cipher(&self) -> SessionStoreResult<BlobCipher> {
        let hex_key = self.secrets.get(names::SESSION_ENCRYPTION_KEY).await?;
        BlobCipher::from_hex(&hex_key)
    }

    fn objects(&self) -> SessionStoreResult<&Arc<dyn ObjectStore>> {
        self.objects
            .as_ref()
            .ok_or(SessionStoreError::ObjectStoreMissing)
    }

    fn mark_dirty(&self, key: &SessionKey) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(key.clone());
        }
    }

    /// Persist a blob, write-through.
    ///
    /// # Errors
    ///
    /// Local write failures surface immediately; in hybrid mode the cloud
    /// copy is deferred to the backup tick and its failures are non-fatal.
    pub async fn save(&self, key: &SessionKey, blob: &CredentialBlob) -> SessionStoreResult<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        match self.config.mode {
            StoreMode::Local => self.write_local(key, blob).await?,
            StoreMode::Hybrid => {
                self.write_local(key, blob).await?;
                self.mark_dirty(key);
            }
            StoreMode::Cloud => self.push_cloud(key, blob).await?,
        }
        debug!(session = %key, files = blob.len(), "Saved credential blob");
        Ok(())
    }

    /// Load a blob. In hybrid and cloud modes a missing local copy is
    /// restored from the object store.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem, object-store, and decryption failures.
    pub async fn load(&self, key: &SessionKey) -> SessionStoreResult<Option<CredentialBlob>> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        match self.config.mode {
            StoreMode::Local => self.read_local(key).await,
            StoreMode::Cloud => self.fetch_cloud(key).await,
            StoreMode::Hybrid => {
                if let Some(blob) = self.read_local(key).await? {
                    return Ok(Some(blob));
                }
                let Some(blob) = self.fetch_cloud(key).await? else {
                    return Ok(None);
                };
                info!(session = %key, "Restored credential blob from object store");
                self.write_local(key, &blob).await?;
                Ok(Some(blob))
            }
        }
    }

    /// Enumerate every persisted session, across both tiers.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem and object-store scan failures.
    pub async fn list_all(&self) -> SessionStoreResult<Vec<SessionKey>> {
        let mut keys = HashSet::new();
        if self.config.mode != StoreMode::Cloud {
            self.scan_local(&mut keys).await?;
        }
        if self.config.mode != StoreMode::Local {
            self.scan_cloud(&mut keys).await?;
        }
        let mut keys: Vec<SessionKey> = keys.into_iter().collect();
        keys.sort();
        Ok(keys)
    }

    /// Destroy a session's blob in every tier. Called on logout only.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem and object-store failures.
    pub async fn delete(&self, key: &SessionKey) -> SessionStoreResult<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;
        let dir = self.local_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if self.config.mode != StoreMode::Local {
            let objects = self.objects()?;
            for object_key in objects.list(&Self::object_prefix(key)).await? {
                objects.delete(&object_key).await?;
            }
        }
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.remove(key);
        }
        info!(session = %key, "Deleted credential blob");
        Ok(())
    }

    /// Back up every modified blob to the object store.
    ///
    /// Failures are logged and the session stays marked for the next tick.
    /// Returns the number of sessions backed up.
    pub async fn backup_tick(&self) -> usize {
        if self.config.mode != StoreMode::Hybrid {
            return 0;
        }
        let pending: Vec<SessionKey> = self
            .dirty
            .lock()
            .map(|dirty| dirty.iter().cloned().collect())
            .unwrap_or_default();
        let mut backed_up = 0_usize;
        for key in pending {
            let lock = self.lock_for(&key);
            let _guard = lock.lock().await;
            let result = async {
                let blob = self
                    .read_local(&key)
                    .await?
                    .ok_or_else(|| SessionStoreError::Cipher("blob vanished".to_string()))?;
                self.push_cloud(&key, &blob).await
            }
            .await;
            match result {
                Ok(()) => {
                    if let Ok(mut dirty) = self.dirty.lock() {
                        dirty.remove(&key);
                    }
                    backed_up = backed_up.saturating_add(1);
                }
                Err(e) => {
                    warn!(session = %key, error = %e, "Blob backup failed, will retry");
                }
            }
        }
        if backed_up > 0 {
            debug!(sessions = backed_up, "Blob backup tick complete");
        }
        backed_up
    }

    /// Periodic backup driver. Runs until cancelled, then performs one
    /// final tick so a graceful shutdown flushes pending changes.
    pub async fn backup_loop(self: Arc<Self>, cancel: CancellationToken) {
        if self.config.mode != StoreMode::Hybrid {
            return;
        }
        let mut interval = tokio::time::interval(self.config.backup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.backup_tick().await;
                }
                () = cancel.cancelled() => {
                    self.backup_tick().await;
                    return;
                }
            }
        }
    }

    async fn write_local(&self, key: &SessionKey, blob: &CredentialBlob) -> SessionStoreResult<()> {
        let dir = self.local_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let mut kept: HashSet<String> = HashSet::new();
        for (name, bytes) in blob.files() {
            tokio::fs::write(dir.join(name), bytes).await?;
            kept.insert(name.to_string());
        }
        // Blobs are wholesale: files the protocol dropped are removed too.
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !kept.contains(&name) {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn read_local(&self, key: &SessionKey) -> SessionStoreResult<Option<CredentialBlob>> {
        let dir = self.local_dir(key);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut blob = CredentialBlob::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let bytes = tokio::fs::read(entry.path()).await?;
                blob.insert(name, bytes);
            }
        }
        if blob.is_empty() {
            return Ok(None);
        }
        Ok(Some(blob))
    }

    async fn push_cloud(&self, key: &SessionKey, blob: &CredentialBlob) -> SessionStoreResult<()> {
        let cipher = self.cipher().await?;
        let objects = self.objects()?;
        let prefix = Self::object_prefix(key);
        let mut kept: HashSet<String> = HashSet::new();
        for (name, bytes) in blob.files() {
            let object_key = format!("{prefix}{name}");
            objects.put(&object_key, cipher.encrypt(bytes)).await?;
            kept.insert(object_key);
        }
        for object_key in objects.list(&prefix).await? {
            if !kept.contains(&object_key) {
                objects.delete(&object_key).await?;
            }
        }
        Ok(())
    }

    async fn fetch_cloud(&self, key: &SessionKey) -> SessionStoreResult<Option<CredentialBlob>> {
        let cipher = self.cipher().await?;
        let objects = self.objects()?;
        let prefix = Self::object_prefix(key);
        let object_keys = objects.list(&prefix).await?;
        if object_keys.is_empty() {
            return Ok(None);
        }
        let mut blob = CredentialBlob::new();
        for object_key in object_keys {
            let Some(encrypted) = objects.get(&object_key).await? else {
                continue;
            };
            let name = object_key
                .rsplit('/')
                .next()
                .unwrap_or(&object_key)
                .to_string();
            blob.insert(name, cipher.decrypt(&encrypted)?);
        }
        if blob.is_empty() {
            return Ok(None);
        }
        Ok(Some(blob))
    }

    async fn scan_local(&self, keys: &mut HashSet<SessionKey>) -> SessionStoreResult<()> {
        let mut users = match tokio::fs::read_dir(&self.config.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(user_entry) = users.next_entry().await? {
            if !user_entry.file_type().await?.is_dir() {
                continue;
            }
            let user = user_entry.file_name().to_string_lossy().into_owned();
            let mut phones = tokio::fs::read_dir(user_entry.path()).await?;
            while let Some(phone_entry) = phones.next_entry().await? {
                if !phone_entry.file_type().await?.is_dir() {
                    continue;
                }
                let phone = phone_entry.file_name().to_string_lossy().into_owned();
                if let Ok(key) = SessionKey::parse(&user, &phone) {
                    keys.insert(key);
                }
            }
        }
        Ok(())
    }

    async fn scan_cloud(&self, keys: &mut HashSet<SessionKey>) -> SessionStoreResult<()> {
        let objects = self.objects()?;
        for object_key in objects.list("sessions/").await? {
            let mut parts = object_key.split('/');
            let (Some("sessions"), Some(user), Some(phone)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if let Ok(key) = SessionKey::parse(user, phone) {
                keys.insert(key);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("mode", &self.config.mode)
            .field("root", &self.config.root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wahub_secrets::StaticSecretProvider;
    use wahub_storage::MemoryObjectStore;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn secrets() -> Arc<SecretStore> {
        Arc::new(SecretStore::new(Arc::new(
            StaticSecretProvider::new().with(names::SESSION_ENCRYPTION_KEY, KEY_HEX),
        )))
    }

    fn session_key() -> SessionKey {
        SessionKey::parse("U1", "+12025550101").unwrap()
    }

    fn blob() -> CredentialBlob {
        CredentialBlob::new()
            .with_file("creds.json", br#"{"noiseKey":"abc"}"#.to_vec())
            .with_file("app-state-sync-key-1.json", vec![0, 1, 2, 255])
    }

    fn store(mode: StoreMode, root: &std::path::Path, objects: Option<Arc<dyn ObjectStore>>) -> SessionStore {
        SessionStore::new(
            SessionStoreConfig {
                mode,
                root: root.to_path_buf(),
                backup_interval: Duration::from_secs(300),
            },
            objects,
            secrets(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(StoreMode::Local, dir.path(), None);
        let key = session_key();

        assert!(store.load(&key).await.unwrap().is_none());
        store.save(&key, &blob()).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(blob()));
    }

    #[tokio::test]
    async fn test_save_removes_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(StoreMode::Local, dir.path(), None);
        let key = session_key();

        store.save(&key, &blob()).await.unwrap();
        let smaller = CredentialBlob::new().with_file("creds.json", vec![9]);
        store.save(&key, &smaller).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(smaller));
    }

    #[tokio::test]
    async fn test_cloud_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let store = store(StoreMode::Cloud, dir.path(), Some(Arc::clone(&objects)));
        let key = session_key();

        store.save(&key, &blob()).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(blob()));

        // Objects are ciphertext, not plaintext
        let stored = objects
            .get("sessions/U1/12025550101/creds.json")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stored, br#"{"noiseKey":"abc"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_hybrid_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let store = store(StoreMode::Hybrid, dir.path(), Some(Arc::clone(&objects)));
        let key = session_key();

        store.save(&key, &blob()).await.unwrap();
        assert_eq!(store.backup_tick().await, 1);
        // Nothing dirty on the second tick
        assert_eq!(store.backup_tick().await, 0);

        // Simulate loss of the local tier
        tokio::fs::remove_dir_all(dir.path().join("U1")).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(blob()));
        // And the restore rehydrated the local copy
        assert!(dir.path().join("U1/12025550101/creds.json").exists());
    }

    #[tokio::test]
    async fn test_list_all_spans_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let store = store(StoreMode::Hybrid, dir.path(), Some(Arc::clone(&objects)));

        let local_key = session_key();
        store.save(&local_key, &blob()).await.unwrap();

        // A blob only present in the object store (written by another instance)
        objects
            .put("sessions/U2/447700900123/creds.json", vec![1])
            .await
            .unwrap();

        let keys = store.list_all().await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&local_key));
        assert!(keys.contains(&SessionKey::parse("U2", "+447700900123").unwrap()));
    }

    #[tokio::test]
    async fn test_delete_removes_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let store = store(StoreMode::Hybrid, dir.path(), Some(Arc::clone(&objects)));
        let key = session_key();

        store.save(&key, &blob()).await.unwrap();
        store.backup_tick().await;
        store.delete(&key).await.unwrap();

        assert!(store.load(&key).await.unwrap().is_none());
        assert!(objects.list("sessions/U1/").await.unwrap().is_empty());
        // Idempotent
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_cloud_mode_requires_object_store() {
        let dir = tempfile::tempdir().unwrap();
        let result = SessionStore::new(
            SessionStoreConfig {
                mode: StoreMode::Cloud,
                root: dir.path().to_path_buf(),
                backup_interval: Duration::from_secs(300),
            },
            None,
            secrets(),
        );
        assert!(matches!(result, Err(SessionStoreError::ObjectStoreMissing)));
    }
}
