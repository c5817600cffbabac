//! Buffered bulk encryption.
//!
//! A `BufferedEncryptor` accumulates serialized records and emits one AEAD
//! blob for the whole batch on flush. The caller ties the flush to a WAL
//! group-commit boundary; if that boundary fails, the entire batch is
//! discarded on recovery — the mode is only valid where all-or-nothing
//! batch replay is acceptable.
//!
//! Batch plaintext framing: repeated [u32 len][record bytes].

use crate::crypto::aead::{MasterKey, RecordCrypto};
use crate::error::{Result, VaultError};

const DEFAULT_BUFFER_KIB: usize = 256;

pub struct BufferedEncryptor {
    crypto: RecordCrypto,
    buffer: Vec<u8>,
    capacity: usize,
    record_count: usize,
}

impl BufferedEncryptor {
    pub fn new(master_key: &MasterKey) -> Self {
        Self::with_capacity_kib(master_key, DEFAULT_BUFFER_KIB)
    }

    pub fn with_capacity_kib(master_key: &MasterKey, buffer_kib: usize) -> Self {
        let capacity = buffer_kib.max(1) * 1024;
        BufferedEncryptor {
            crypto: RecordCrypto::new(master_key),
            buffer: Vec::with_capacity(capacity),
            capacity,
            record_count: 0,
        }
    }

    /// Queue one record. Returns true when the buffer is at capacity and
    /// the caller should flush.
    pub fn push(&mut self, record: &[u8]) -> bool {
        self.buffer.extend_from_slice(&(record.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(record);
        self.record_count += 1;
        self.buffer.len() >= self.capacity
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Encrypt the whole batch into a single blob and reset the buffer.
    /// Returns `None` for an empty batch.
    pub fn flush(&mut self) -> Result<Option<Vec<u8>>> {
        if self.record_count == 0 {
            return Ok(None);
        }
        let blob = self.crypto.encrypt(&self.buffer)?;
        self.buffer.clear();
        self.record_count = 0;
        Ok(Some(blob))
    }

    /// Decrypt a batch blob back into its records.
    pub fn decrypt_batch(&self, blob: &[u8]) -> Result<Vec<Vec<u8>>> {
        let plain = self.crypto.decrypt(blob)?;
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < plain.len() {
            if plain.len() < offset + 4 {
                return Err(VaultError::Corruption("truncated batch frame".to_string()));
            }
            let len = u32::from_le_bytes(plain[offset..offset + 4].try_into().expect("4-byte slice")) as usize;
            offset += 4;
            if plain.len() < offset + len {
                return Err(VaultError::Corruption("truncated batch record".to_string()));
            }
            records.push(plain[offset..offset + len].to_vec());
            offset += len;
        }
        Ok(records)
    }
}
