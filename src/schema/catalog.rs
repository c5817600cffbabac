//! Table catalog: schemas, engine bindings and index definitions,
//! persisted in the database directory's `header` file.
//!
//! Header file layout:
//!   magic (8) || format version (u32) || flags (u8) || salt (16)
//!   || blob_len (u32) || catalog blob
//!
//! The salt and flags are plaintext (they are needed before the key
//! exists); the catalog blob goes through the cipher, so schema names
//! never touch disk in the clear when encryption is on. Bit 0 of flags
//! records whether the database was written encrypted — open refuses a
//! runtime mode that disagrees.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::crypto::Cipher;
use crate::error::{Result, VaultError};
use crate::index::IndexKind;
use crate::schema::column::ColumnDef;
use crate::storage::EngineKind;

const MAGIC: &[u8; 8] = b"VAULTHDR";
const FORMAT_VERSION: u32 = 1;
const FLAG_ENCRYPTED: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub column: String,
    pub kind: IndexKind,
    pub unique: bool,
}

impl IndexDef {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        push_str(&mut buf, &self.name);
        push_str(&mut buf, &self.column);
        buf.push(self.kind.tag());
        buf.push(u8::from(self.unique));
        buf
    }

    fn deserialize(data: &[u8]) -> Option<(Self, usize)> {
        let (name, mut offset) = read_str(data, 0)?;
        let (column, next) = read_str(data, offset)?;
        offset = next;
        if data.len() < offset + 2 {
            return None;
        }
        let kind = IndexKind::from_tag(data[offset])?;
        let unique = data[offset + 1] != 0;
        Some((IndexDef { name, column, kind, unique }, offset + 2))
    }
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub engine: EngineKind,
    pub indexes: Vec<IndexDef>,
    /// Next value for an AUTO INTEGER primary key.
    pub next_auto_id: i64,
    /// Whether bulk inserts route through the buffered encryptor; fixed
    /// for the lifetime of the table.
    pub buffered_encryption: bool,
    /// Numeric id tying pages to their table.
    pub table_id: u32,
}

impl TableDef {
    pub fn pk_column(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.is_primary_key)
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn data_file_name(&self) -> String {
        format!("{}.{}", self.name, self.engine.file_suffix())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        push_str(&mut buf, &self.name);
        buf.push(self.engine.tag());
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.next_auto_id.to_le_bytes());
        buf.push(u8::from(self.buffered_encryption));

        buf.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for column in &self.columns {
            let bytes = column.serialize();
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }

        buf.extend_from_slice(&(self.indexes.len() as u16).to_le_bytes());
        for index in &self.indexes {
            let bytes = index.serialize();
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    fn deserialize(data: &[u8]) -> Option<(Self, usize)> {
        let (name, mut offset) = read_str(data, 0)?;
        if data.len() < offset + 1 + 4 + 8 + 1 + 2 {
            return None;
        }
        let engine = EngineKind::from_tag(data[offset])?;
        offset += 1;
        let table_id = u32::from_le_bytes(data[offset..offset + 4].try_into().ok()?);
        offset += 4;
        let next_auto_id = i64::from_le_bytes(data[offset..offset + 8].try_into().ok()?);
        offset += 8;
        let buffered_encryption = data[offset] != 0;
        offset += 1;

        let column_count = u16::from_le_bytes(data[offset..offset + 2].try_into().ok()?) as usize;
        offset += 2;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            if data.len() < offset + 2 {
                return None;
            }
            let len = u16::from_le_bytes(data[offset..offset + 2].try_into().ok()?) as usize;
            offset += 2;
            if data.len() < offset + len {
                return None;
            }
            let (column, _) = ColumnDef::deserialize(&data[offset..offset + len])?;
            columns.push(column);
            offset += len;
        }

        if data.len() < offset + 2 {
            return None;
        }
        let index_count = u16::from_le_bytes(data[offset..offset + 2].try_into().ok()?) as usize;
        offset += 2;
        let mut indexes = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            if data.len() < offset + 2 {
                return None;
            }
            let len = u16::from_le_bytes(data[offset..offset + 2].try_into().ok()?) as usize;
            offset += 2;
            if data.len() < offset + len {
                return None;
            }
            let (index, _) = IndexDef::deserialize(&data[offset..offset + len])?;
            indexes.push(index);
            offset += len;
        }

        Some((
            TableDef {
                name,
                columns,
                engine,
                indexes,
                next_auto_id,
                buffered_encryption,
                table_id,
            },
            offset,
        ))
    }
}

#[derive(Default)]
pub struct Catalog {
    /// Lowercased table name -> definition (lookup is case-insensitive,
    /// stored names preserve case).
    tables: HashMap<String, TableDef>,
    next_table_id: u32,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog { tables: HashMap::new(), next_table_id: 1 }
    }

    pub fn get(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(&name.to_lowercase())
            .ok_or_else(|| VaultError::Catalog(format!("no such table: {name}")))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut TableDef> {
        self.tables
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| VaultError::Catalog(format!("no such table: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.values().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn create_table(
        &mut self,
        name: &str,
        columns: Vec<ColumnDef>,
        engine: EngineKind,
        buffered_encryption: bool,
    ) -> Result<&TableDef> {
        let key = name.to_lowercase();
        if self.tables.contains_key(&key) {
            return Err(VaultError::Catalog(format!("table already exists: {name}")));
        }
        if columns.is_empty() {
            return Err(VaultError::Catalog("a table needs at least one column".to_string()));
        }
        if columns.iter().filter(|c| c.is_primary_key).count() > 1 {
            return Err(VaultError::Catalog("multiple PRIMARY KEY columns".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.to_lowercase()) {
                return Err(VaultError::Catalog(format!("duplicate column: {}", column.name)));
            }
        }

        let table_id = self.next_table_id;
        self.next_table_id += 1;
        let def = TableDef {
            name: name.to_string(),
            columns,
            engine,
            indexes: Vec::new(),
            next_auto_id: 1,
            buffered_encryption,
            table_id,
        };
        Ok(self.tables.entry(key).or_insert(def))
    }

    pub fn drop_table(&mut self, name: &str) -> Result<TableDef> {
        self.tables
            .remove(&name.to_lowercase())
            .ok_or_else(|| VaultError::Catalog(format!("no such table: {name}")))
    }

    pub fn rename_table(&mut self, old: &str, new: &str) -> Result<()> {
        if self.contains(new) {
            return Err(VaultError::Catalog(format!("table already exists: {new}")));
        }
        let mut def = self.drop_table(old)?;
        def.name = new.to_string();
        self.tables.insert(new.to_lowercase(), def);
        Ok(())
    }

    pub fn add_index(&mut self, table: &str, index: IndexDef) -> Result<()> {
        if self.find_index(&index.name).is_some() {
            return Err(VaultError::Catalog(format!("index already exists: {}", index.name)));
        }
        let def = self.get_mut(table)?;
        if def.column(&index.column).is_none() {
            return Err(VaultError::Catalog(format!(
                "no such column: {}.{}",
                table, index.column
            )));
        }
        def.indexes.push(index);
        Ok(())
    }

    /// Find an index by name; returns the owning table's name.
    pub fn find_index(&self, index_name: &str) -> Option<(&TableDef, &IndexDef)> {
        for table in self.tables.values() {
            for index in &table.indexes {
                if index.name.eq_ignore_ascii_case(index_name) {
                    return Some((table, index));
                }
            }
        }
        None
    }

    pub fn drop_index(&mut self, index_name: &str) -> Result<String> {
        for table in self.tables.values_mut() {
            if let Some(pos) = table
                .indexes
                .iter()
                .position(|i| i.name.eq_ignore_ascii_case(index_name))
            {
                table.indexes.remove(pos);
                return Ok(table.name.clone());
            }
        }
        Err(VaultError::Catalog(format!("no such index: {index_name}")))
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.next_table_id.to_le_bytes());
        let mut tables: Vec<&TableDef> = self.tables.values().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        buf.extend_from_slice(&(tables.len() as u16).to_le_bytes());
        for table in tables {
            let bytes = table.serialize();
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let corrupt = || VaultError::Corruption("malformed catalog".to_string());
        if data.len() < 6 {
            return Err(corrupt());
        }
        let next_table_id = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let count = u16::from_le_bytes(data[4..6].try_into().expect("2-byte slice")) as usize;
        let mut offset = 6;
        let mut tables = HashMap::with_capacity(count);
        for _ in 0..count {
            if data.len() < offset + 4 {
                return Err(corrupt());
            }
            let len =
                u32::from_le_bytes(data[offset..offset + 4].try_into().expect("4-byte slice")) as usize;
            offset += 4;
            if data.len() < offset + len {
                return Err(corrupt());
            }
            let (table, _) = TableDef::deserialize(&data[offset..offset + len]).ok_or_else(corrupt)?;
            offset += len;
            tables.insert(table.name.to_lowercase(), table);
        }
        Ok(Catalog { tables, next_table_id })
    }

    /// Persist the catalog into the `header` file.
    pub fn save(&self, path: &Path, cipher: &Cipher, salt: &[u8; 16]) -> Result<()> {
        let blob = cipher.encrypt(&self.serialize())?;
        let mut out = Vec::with_capacity(8 + 4 + 1 + 16 + 4 + blob.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.push(if cipher.is_encrypting() { FLAG_ENCRYPTED } else { 0 });
        out.extend_from_slice(salt);
        out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        out.extend_from_slice(&blob);

        // Write-then-rename so a crash never leaves a torn header.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &out)?;
        let file = fs::File::open(&tmp)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path, cipher: &Cipher) -> Result<Self> {
        let data = fs::read(path)?;
        let (flags, blob) = parse_header(&data)?;
        let encrypted = flags & FLAG_ENCRYPTED != 0;
        if encrypted != cipher.is_encrypting() {
            return Err(VaultError::Corruption(
                "header encryption flag disagrees with runtime no_encrypt_mode".to_string(),
            ));
        }
        Self::deserialize(&cipher.decrypt(blob)?)
    }

    /// Salt is readable before any key exists.
    pub fn read_salt(path: &Path) -> Result<[u8; 16]> {
        let data = fs::read(path)?;
        if data.len() < 13 + 16 || &data[0..8] != MAGIC {
            return Err(VaultError::Corruption("malformed header file".to_string()));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&data[13..29]);
        Ok(salt)
    }
}

fn parse_header(data: &[u8]) -> Result<(u8, &[u8])> {
    let corrupt = || VaultError::Corruption("malformed header file".to_string());
    if data.len() < 33 || &data[0..8] != MAGIC {
        return Err(corrupt());
    }
    let version = u32::from_le_bytes(data[8..12].try_into().expect("4-byte slice"));
    if version != FORMAT_VERSION {
        return Err(VaultError::Corruption(format!("unsupported header version {version}")));
    }
    let flags = data[12];
    let blob_len = u32::from_le_bytes(data[29..33].try_into().expect("4-byte slice")) as usize;
    if data.len() < 33 + blob_len {
        return Err(corrupt());
    }
    Ok((flags, &data[33..33 + blob_len]))
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_str(data: &[u8], offset: usize) -> Option<(String, usize)> {
    if data.len() < offset + 2 {
        return None;
    }
    let len = u16::from_le_bytes(data[offset..offset + 2].try_into().ok()?) as usize;
    if data.len() < offset + 2 + len {
        return None;
    }
    let s = String::from_utf8(data[offset + 2..offset + 2 + len].to_vec()).ok()?;
    Some((s, offset + 2 + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::types::DataType;
    use tempfile::TempDir;

    fn sample_catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog
            .create_table(
                "Users",
                vec![
                    ColumnDef::new("id", DataType::Integer).primary_key().auto(),
                    ColumnDef::new("email", DataType::Text),
                ],
                EngineKind::PageBased,
                false,
            )
            .unwrap();
        catalog
            .add_index(
                "users",
                IndexDef {
                    name: "idx_email".to_string(),
                    column: "email".to_string(),
                    kind: IndexKind::Hash,
                    unique: true,
                },
            )
            .unwrap();
        catalog
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let catalog = sample_catalog();
        assert_eq!(catalog.get("USERS").unwrap().name, "Users");
        assert!(catalog.get("missing").is_err());
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut catalog = sample_catalog();
        assert!(matches!(
            catalog.create_table("users", vec![ColumnDef::new("x", DataType::Integer)], EngineKind::Columnar, false),
            Err(VaultError::Catalog(_))
        ));
    }

    #[test]
    fn test_rename_table() {
        let mut catalog = sample_catalog();
        catalog.rename_table("users", "accounts").unwrap();
        assert!(catalog.get("users").is_err());
        assert_eq!(catalog.get("accounts").unwrap().indexes.len(), 1);
    }

    #[test]
    fn test_drop_index() {
        let mut catalog = sample_catalog();
        let owner = catalog.drop_index("IDX_EMAIL").unwrap();
        assert_eq!(owner, "Users");
        assert!(catalog.drop_index("idx_email").is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("header");
        let cipher = Cipher::new(&MasterKey::new([0x42u8; 32]), false);
        let salt = [7u8; 16];

        sample_catalog().save(&path, &cipher, &salt).unwrap();
        assert_eq!(Catalog::read_salt(&path).unwrap(), salt);

        let loaded = Catalog::load(&path, &cipher).unwrap();
        let table = loaded.get("users").unwrap();
        assert_eq!(table.name, "Users");
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.engine, EngineKind::PageBased);
        assert_eq!(table.indexes.len(), 1);
        assert!(table.columns[0].auto);
    }

    #[test]
    fn test_load_with_wrong_key_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("header");
        let cipher = Cipher::new(&MasterKey::new([0x42u8; 32]), false);
        sample_catalog().save(&path, &cipher, &[0u8; 16]).unwrap();

        let wrong = Cipher::new(&MasterKey::new([0x43u8; 32]), false);
        assert!(matches!(Catalog::load(&path, &wrong), Err(VaultError::Decryption)));
    }

    #[test]
    fn test_encryption_flag_mismatch_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("header");
        let key = MasterKey::new([0x42u8; 32]);
        let plain = Cipher::new(&key, true);
        sample_catalog().save(&path, &plain, &[0u8; 16]).unwrap();

        let aead = Cipher::new(&key, false);
        assert!(matches!(Catalog::load(&path, &aead), Err(VaultError::Corruption(_))));
    }
}
