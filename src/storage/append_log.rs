//! Encrypted append-only record log backing `<table>.dat` files.
//!
//! Plaintext record: [len: u32][flags: u8][payload][crc32: u32], where the
//! CRC covers flags + payload. The whole record is AEAD-wrapped, and the
//! encrypted blob is framed on disk as [blob_len: u32][blob]. Offsets
//! handed out to callers point at the frame start.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::crypto::Cipher;
use crate::error::{Result, VaultError};

/// Record flags.
pub const REC_DATA: u8 = 0;
/// Payload is the 8-byte offset of the record being deleted.
pub const REC_TOMBSTONE: u8 = 1;
/// Payload is the 8-byte offset of the superseded record, then row bytes.
pub const REC_SUPERSEDE: u8 = 2;

pub struct AppendLog {
    file: File,
    cipher: Arc<Cipher>,
    write_offset: u64,
}

impl AppendLog {
    pub fn create(path: &Path, cipher: Arc<Cipher>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(AppendLog { file, cipher, write_offset: 0 })
    }

    pub fn open(path: &Path, cipher: Arc<Cipher>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let write_offset = file.metadata()?.len();
        Ok(AppendLog { file, cipher, write_offset })
    }

    /// Append one record; returns its frame offset.
    pub fn append(&mut self, flags: u8, payload: &[u8]) -> Result<u64> {
        let mut plain = Vec::with_capacity(9 + payload.len());
        plain.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        plain.push(flags);
        plain.extend_from_slice(payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[flags]);
        hasher.update(payload);
        plain.extend_from_slice(&hasher.finalize().to_le_bytes());

        let blob = self.cipher.encrypt(&plain)?;
        let offset = self.write_offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&(blob.len() as u32).to_le_bytes())?;
        self.file.write_all(&blob)?;
        self.write_offset += 4 + blob.len() as u64;
        Ok(offset)
    }

    /// Read the record whose frame starts at `offset`.
    pub fn read_at(&mut self, offset: u64) -> Result<(u8, Vec<u8>)> {
        if offset + 4 > self.write_offset {
            return Err(VaultError::Corruption(format!("record offset {offset} out of range")));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let blob_len = u32::from_le_bytes(len_buf) as usize;
        if offset + 4 + blob_len as u64 > self.write_offset {
            return Err(VaultError::Corruption(format!("record at {offset} is truncated")));
        }
        let mut blob = vec![0u8; blob_len];
        self.file.read_exact(&mut blob)?;
        decode_record(&self.cipher, &blob)
    }

    /// Sequentially scan every record, stopping at the first invalid
    /// frame. A torn tail (partial final record after a crash) is
    /// truncated away so subsequent appends start from a clean boundary.
    pub fn scan(&mut self) -> Result<Vec<(u64, u8, Vec<u8>)>> {
        let mut records = Vec::new();
        let mut offset = 0u64;
        self.file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        self.file.read_to_end(&mut data)?;

        while offset + 4 <= data.len() as u64 {
            let start = offset as usize;
            let blob_len =
                u32::from_le_bytes(data[start..start + 4].try_into().expect("4-byte slice")) as usize;
            let end = start + 4 + blob_len;
            if end > data.len() {
                break;
            }
            match decode_record(&self.cipher, &data[start + 4..end]) {
                Ok((flags, payload)) => records.push((offset, flags, payload)),
                Err(_) => break,
            }
            offset = end as u64;
        }

        if offset < data.len() as u64 {
            warn!(
                valid = offset,
                total = data.len(),
                "append log has a torn tail, truncating"
            );
            self.file.set_len(offset)?;
            self.file.sync_all()?;
        }
        self.write_offset = offset;
        Ok(records)
    }

    pub fn len(&self) -> u64 {
        self.write_offset
    }

    pub fn is_empty(&self) -> bool {
        self.write_offset == 0
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn decode_record(cipher: &Cipher, blob: &[u8]) -> Result<(u8, Vec<u8>)> {
    let plain = cipher.decrypt(blob)?;
    if plain.len() < 9 {
        return Err(VaultError::Corruption("record too short".to_string()));
    }
    let payload_len = u32::from_le_bytes(plain[0..4].try_into().expect("4-byte slice")) as usize;
    if plain.len() != 9 + payload_len {
        return Err(VaultError::Corruption("record length mismatch".to_string()));
    }
    let flags = plain[4];
    let payload = &plain[5..5 + payload_len];
    let stored_crc =
        u32::from_le_bytes(plain[5 + payload_len..9 + payload_len].try_into().expect("4-byte slice"));
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[flags]);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(VaultError::Corruption("record CRC mismatch".to_string()));
    }
    Ok((flags, payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use tempfile::TempDir;

    fn test_cipher() -> Arc<Cipher> {
        Arc::new(Cipher::new(&MasterKey::new([0x42u8; 32]), false))
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let mut log = AppendLog::create(&path, test_cipher()).unwrap();

        let a = log.append(REC_DATA, b"first row").unwrap();
        let b = log.append(REC_DATA, b"second row").unwrap();
        assert!(b > a);

        assert_eq!(log.read_at(a).unwrap(), (REC_DATA, b"first row".to_vec()));
        assert_eq!(log.read_at(b).unwrap(), (REC_DATA, b"second row".to_vec()));
    }

    #[test]
    fn test_scan_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        let mut offsets = Vec::new();
        {
            let mut log = AppendLog::create(&path, test_cipher()).unwrap();
            for i in 0..10u8 {
                offsets.push(log.append(REC_DATA, &[i; 16]).unwrap());
            }
            log.sync().unwrap();
        }
        let mut log = AppendLog::open(&path, test_cipher()).unwrap();
        let records = log.scan().unwrap();
        assert_eq!(records.len(), 10);
        for (i, (offset, flags, payload)) in records.iter().enumerate() {
            assert_eq!(*offset, offsets[i]);
            assert_eq!(*flags, REC_DATA);
            assert_eq!(payload, &[i as u8; 16]);
        }
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.dat");
        {
            let mut log = AppendLog::create(&path, test_cipher()).unwrap();
            log.append(REC_DATA, b"complete").unwrap();
            log.append(REC_DATA, b"will be torn").unwrap();
            log.sync().unwrap();
        }
        // Chop bytes off the final record to simulate a crash mid-write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let mut log = AppendLog::open(&path, test_cipher()).unwrap();
        let records = log.scan().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].2, b"complete".to_vec());

        // Appends continue from the clean boundary.
        let off = log.append(REC_DATA, b"after recovery").unwrap();
        assert_eq!(log.read_at(off).unwrap().1, b"after recovery".to_vec());
    }
}
