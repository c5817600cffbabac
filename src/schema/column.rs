use crate::sql::ast::ColumnSpec;
use crate::types::DataType;

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub is_primary_key: bool,
    /// AUTO column: populated on insert when omitted (auto-increment for
    /// INTEGER, generated ULID/GUID, NOW() for DATETIME).
    pub auto: bool,
    pub is_unique: bool,
    pub not_null: bool,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: DataType) -> Self {
        ColumnDef {
            name: name.to_string(),
            data_type,
            is_primary_key: false,
            auto: false,
            is_unique: false,
            not_null: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.not_null = true;
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }

    pub fn from_spec(spec: &ColumnSpec) -> Self {
        ColumnDef {
            name: spec.name.clone(),
            data_type: spec.data_type,
            is_primary_key: spec.is_primary_key,
            auto: spec.auto,
            is_unique: spec.is_unique,
            not_null: spec.not_null || spec.is_primary_key,
        }
    }

    /// Serialize: [name_len: u16][name][type_tag: u8][flags: u8]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let name_bytes = self.name.as_bytes();
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.push(self.data_type.tag());
        let mut flags: u8 = 0;
        if self.is_primary_key {
            flags |= 0x01;
        }
        if self.auto {
            flags |= 0x02;
        }
        if self.is_unique {
            flags |= 0x04;
        }
        if self.not_null {
            flags |= 0x08;
        }
        buf.push(flags);
        buf
    }

    /// Deserialize; returns (ColumnDef, bytes consumed).
    pub fn deserialize(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < 2 {
            return None;
        }
        let name_len = u16::from_le_bytes(data[0..2].try_into().ok()?) as usize;
        if data.len() < 2 + name_len + 2 {
            return None;
        }
        let name = String::from_utf8(data[2..2 + name_len].to_vec()).ok()?;
        let data_type = DataType::from_tag(data[2 + name_len])?;
        let flags = data[2 + name_len + 1];
        Some((
            ColumnDef {
                name,
                data_type,
                is_primary_key: flags & 0x01 != 0,
                auto: flags & 0x02 != 0,
                is_unique: flags & 0x04 != 0,
                not_null: flags & 0x08 != 0,
            },
            2 + name_len + 2,
        ))
    }
}
