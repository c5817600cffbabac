use argon2::Argon2;

use crate::crypto::aead::MasterKey;
use crate::error::{Result, VaultError};

/// Derive a 256-bit master key from a passphrase using Argon2id.
pub fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<MasterKey> {
    let mut output = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| VaultError::Kdf(e.to_string()))?;
    Ok(MasterKey::new(output))
}

/// Generate a random 16-byte salt.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
    salt
}
