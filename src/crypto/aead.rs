use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};

/// Nonce size for AES-GCM-SIV is 12 bytes.
pub const NONCE_SIZE: usize = 12;
/// Authentication tag is 16 bytes.
pub const TAG_SIZE: usize = 16;
/// Total overhead added to every encrypted blob.
pub const AEAD_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// 256-bit master key for AES-256-GCM-SIV.
/// Key material is zeroed on drop to prevent leaking secrets in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    pub fn new(key: [u8; 32]) -> Self {
        MasterKey { key }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(VaultError::Encryption("master key must be 32 bytes".to_string()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(slice);
        Ok(MasterKey { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Record/page-level AEAD.
///
/// Output layout: nonce (12 bytes) || ciphertext || tag (16 bytes).
/// Each call draws a fresh random nonce, so two encryptions of the same
/// plaintext never produce the same bytes. The cipher holds no mutable
/// state, so one instance is safe to share across threads.
pub struct RecordCrypto {
    cipher: Aes256GcmSiv,
}

impl RecordCrypto {
    pub fn new(master_key: &MasterKey) -> Self {
        let cipher = Aes256GcmSiv::new_from_slice(master_key.as_bytes()).expect("valid key size");
        RecordCrypto { cipher }
    }

    /// Encrypt plaintext. Returns: nonce || ciphertext || tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt: input = nonce || ciphertext || tag.
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        if encrypted.len() < AEAD_OVERHEAD {
            return Err(VaultError::Decryption);
        }
        let nonce = Nonce::from_slice(&encrypted[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &encrypted[NONCE_SIZE..])
            .map_err(|_| VaultError::Decryption)
    }

    pub const fn overhead() -> usize {
        AEAD_OVERHEAD
    }
}
