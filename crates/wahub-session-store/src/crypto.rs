//! Per-file AES-256-CBC encryption for blob backups.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{SessionStoreError, SessionStoreResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Symmetric cipher for backup files.
///
/// Wire format: `IV (16 bytes) || AES-256-CBC ciphertext (PKCS7)`.
#[derive(Clone)]
pub struct BlobCipher {
    key: [u8; KEY_LEN],
}

impl BlobCipher {
    /// Build a cipher from a hex-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::InvalidKeyMaterial`] when the string is
    /// not 64 hex characters.
    pub fn from_hex(hex_key: &str) -> SessionStoreResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SessionStoreError::InvalidKeyMaterial(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            SessionStoreError::InvalidKeyMaterial(format!(
                "expected {KEY_LEN} bytes of key material"
            ))
        })?;
        Ok(Self { key })
    }

    /// Encrypt one file with a fresh random IV.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0_u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut out = Vec::with_capacity(IV_LEN.saturating_add(ciphertext.len()));
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt one file produced by [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::Cipher`] on truncated input, a wrong
    /// key, or corrupted ciphertext.
    pub fn decrypt(&self, data: &[u8]) -> SessionStoreResult<Vec<u8>> {
        if data.len() < IV_LEN {
            return Err(SessionStoreError::Cipher("ciphertext too short".to_string()));
        }
        let (iv, ciphertext) = data.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| SessionStoreError::Cipher("bad IV".to_string()))?;
        Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| SessionStoreError::Cipher(e.to_string()))
    }
}

impl std::fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_round_trip() {
        let cipher = BlobCipher::from_hex(KEY).unwrap();
        let plaintext = b"{\"noiseKey\":\"...\"}".to_vec();
        let encrypted = cipher.encrypt(&plaintext);
        assert_ne!(encrypted, plaintext);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
    }

    #[test]
    fn test_fresh_iv_per_file() {
        let cipher = BlobCipher::from_hex(KEY).unwrap();
        let a = cipher.encrypt(b"same bytes");
        let b = cipher.encrypt(b"same bytes");
        assert_ne!(a, b);
        assert_ne!(a[..16], b[..16]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = BlobCipher::from_hex(KEY).unwrap();
        let other = BlobCipher::from_hex(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        let encrypted = cipher.encrypt(b"secret");
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let cipher = BlobCipher::from_hex(KEY).unwrap();
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_bad_key_material() {
        assert!(BlobCipher::from_hex("deadbeef").is_err());
        assert!(BlobCipher::from_hex("zz").is_err());
    }

    #[test]
    fn test_empty_plaintext_round_trip() {
        let cipher = BlobCipher::from_hex(KEY).unwrap();
        let encrypted = cipher.encrypt(b"");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), Vec::<u8>::new());
    }
}
