//! Session store error types.

use thiserror::Error;

/// Errors from session blob storage.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store operation failed.
    #[error("object store error: {0}")]
    Object(#[from] wahub_storage::StorageError),

    /// Encryption key could not be resolved.
    #[error("encryption key unavailable: {0}")]
    Key(#[from] wahub_secrets::SecretsError),

    /// The encryption key material is malformed.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Encryption or decryption failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// The requested mode needs an object store and none was provided.
    #[error("storage mode requires an object store")]
    ObjectStoreMissing,
}

/// Result type for session store operations.
pub type SessionStoreResult<T> = Result<T, SessionStoreError>;
