//! Encryption mode switch.
//!
//! `Cipher::Plain` keeps the on-disk layout byte-compatible with the
//! encrypted form — the nonce and tag fields are zero-filled — so file
//! offsets and page sizes are identical in both modes. The header records
//! which mode wrote a file; opening with a mismatched runtime flag is
//! refused at the database layer.

use crate::crypto::aead::{MasterKey, RecordCrypto, AEAD_OVERHEAD, NONCE_SIZE};
use crate::error::{Result, VaultError};

pub enum Cipher {
    Plain,
    Aead(RecordCrypto),
}

impl Cipher {
    pub fn new(master_key: &MasterKey, no_encrypt: bool) -> Self {
        if no_encrypt {
            Cipher::Plain
        } else {
            Cipher::Aead(RecordCrypto::new(master_key))
        }
    }

    pub fn is_encrypting(&self) -> bool {
        matches!(self, Cipher::Aead(_))
    }

    /// Overhead is constant across modes so encrypted sizes are fixed.
    pub const fn overhead() -> usize {
        AEAD_OVERHEAD
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Aead(c) => c.encrypt(plaintext),
            Cipher::Plain => {
                let mut out = Vec::with_capacity(plaintext.len() + AEAD_OVERHEAD);
                out.extend_from_slice(&[0u8; NONCE_SIZE]);
                out.extend_from_slice(plaintext);
                out.extend_from_slice(&[0u8; AEAD_OVERHEAD - NONCE_SIZE]);
                Ok(out)
            }
        }
    }

    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Aead(c) => c.decrypt(encrypted),
            Cipher::Plain => {
                if encrypted.len() < AEAD_OVERHEAD {
                    return Err(VaultError::Decryption);
                }
                Ok(encrypted[NONCE_SIZE..encrypted.len() - (AEAD_OVERHEAD - NONCE_SIZE)].to_vec())
            }
        }
    }
}
