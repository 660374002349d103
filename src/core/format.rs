//! Purpose: Byte layout of encoded index files and its versioning.
//! Exports: `FileHeader`, `NameTable`, `TableInfo`, `Location`, layout constants.
//! Role: Shared codec for the builder (write side) and reader (read side).
//! Invariants: All integers are little-endian; the header is exactly `HEADER_SIZE` bytes.
//! Invariants: Version list is additive; bump only for incompatible on-disk changes.
use crate::core::digest::HashAlgorithm;
use crate::core::error::{Error, ErrorKind};
use crate::core::source::ColumnSchema;

pub const MAGIC: [u8; 4] = *b"FRIX";
pub const FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[FORMAT_VERSION];
const ENDIANNESS_LE: u8 = 1;
pub const HEADER_SIZE: usize = 80;

const FLAG_IGNORE_TYPES: u8 = 0b0000_0001;

pub const LOCATION_SIZE: usize = 16;
/// Per-entry bytes besides the digest: the u32 location count.
pub const ENTRY_PREFIX_SIZE: usize = 4;
pub const OFFSET_SIZE: usize = 8;

/// Coordinates of one encoded cell: indexes into the name table plus the source row ordinal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Location {
    pub table_id: u32,
    pub column_id: u32,
    pub row: u64,
}

impl Location {
    pub fn new(table_id: u32, column_id: u32, row: u64) -> Self {
        Self {
            table_id,
            column_id,
            row,
        }
    }

    pub fn encode(&self) -> [u8; LOCATION_SIZE] {
        let mut buf = [0u8; LOCATION_SIZE];
        write_u32(&mut buf, 0, self.table_id);
        write_u32(&mut buf, 4, self.column_id);
        write_u64(&mut buf, 8, self.row);
        buf
    }

    /// Caller guarantees `buf.len() >= LOCATION_SIZE`.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            table_id: read_u32(buf, 0),
            column_id: read_u32(buf, 4),
            row: read_u64(buf, 8),
        }
    }

    pub fn same_column(&self, table_id: u32, column_id: u32) -> bool {
        self.table_id == table_id && self.column_id == column_id
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub algorithm: HashAlgorithm,
    pub ignore_types: bool,
    pub sample_size: Option<u64>,
    pub names_offset: u64,
    pub names_len: u64,
    pub index_offset: u64,
    pub entry_count: u64,
    pub offsets_offset: u64,
    pub cell_count: u64,
    pub file_size: u64,
}

impl FileHeader {
    pub fn new(algorithm: HashAlgorithm, ignore_types: bool, sample_size: Option<u64>) -> Self {
        Self {
            algorithm,
            ignore_types,
            sample_size,
            names_offset: HEADER_SIZE as u64,
            names_len: 0,
            index_offset: HEADER_SIZE as u64,
            entry_count: 0,
            offsets_offset: HEADER_SIZE as u64,
            cell_count: 0,
            file_size: HEADER_SIZE as u64,
        }
    }

    pub fn digest_len(&self) -> usize {
        self.algorithm.output_len()
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        write_u32(&mut buf, 4, FORMAT_VERSION);
        buf[8] = ENDIANNESS_LE;
        buf[9] = if self.ignore_types { FLAG_IGNORE_TYPES } else { 0 };
        buf[10..12].copy_from_slice(&self.algorithm.id().to_le_bytes());
        buf[12..14].copy_from_slice(&(self.digest_len() as u16).to_le_bytes());
        write_u64(&mut buf, 16, self.sample_size.unwrap_or(0));
        write_u64(&mut buf, 24, self.names_offset);
        write_u64(&mut buf, 32, self.names_len);
        write_u64(&mut buf, 40, self.index_offset);
        write_u64(&mut buf, 48, self.entry_count);
        write_u64(&mut buf, 56, self.offsets_offset);
        write_u64(&mut buf, 64, self.cell_count);
        write_u64(&mut buf, 72, self.file_size);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(corrupt("header too small", 0));
        }
        if buf[0..4] != MAGIC {
            return Err(corrupt("bad magic", 0).with_hint("Is this a file written by `encode`?"));
        }
        let version = read_u32(buf, 4);
        if !SUPPORTED_FORMAT_VERSIONS.contains(&version) {
            return Err(format_version_error(version));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(corrupt("unsupported endianness", 8));
        }
        if buf[9] & !FLAG_IGNORE_TYPES != 0 {
            return Err(corrupt("unknown header flags", 9));
        }
        let algorithm_id = u16::from_le_bytes([buf[10], buf[11]]);
        let algorithm = HashAlgorithm::from_id(algorithm_id)
            .ok_or_else(|| corrupt(format!("unknown hash algorithm id {algorithm_id}"), 10))?;
        let digest_len = u16::from_le_bytes([buf[12], buf[13]]) as usize;
        if digest_len != algorithm.output_len() {
            return Err(corrupt(
                format!("digest length {digest_len} does not match {algorithm}"),
                12,
            ));
        }
        let sample_size = match read_u64(buf, 16) {
            0 => None,
            size => Some(size),
        };

        Ok(Self {
            algorithm,
            ignore_types: buf[9] & FLAG_IGNORE_TYPES != 0,
            sample_size,
            names_offset: read_u64(buf, 24),
            names_len: read_u64(buf, 32),
            index_offset: read_u64(buf, 40),
            entry_count: read_u64(buf, 48),
            offsets_offset: read_u64(buf, 56),
            cell_count: read_u64(buf, 64),
            file_size: read_u64(buf, 72),
        })
    }

    /// Checks section bounds against the actual file length.
    pub fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        if self.file_size != actual_file_size {
            return Err(corrupt(
                format!(
                    "file size mismatch (header {}, actual {actual_file_size})",
                    self.file_size
                ),
                72,
            ));
        }
        let names_end = self
            .names_offset
            .checked_add(self.names_len)
            .ok_or_else(|| corrupt("names section overflows", 24))?;
        if self.names_offset != HEADER_SIZE as u64 || names_end != self.index_offset {
            return Err(corrupt("names section out of place", 24));
        }
        if self.index_offset > self.offsets_offset {
            return Err(corrupt("index section out of place", 40));
        }
        let offsets_len = self
            .entry_count
            .checked_mul(OFFSET_SIZE as u64)
            .ok_or_else(|| corrupt("entry count overflows", 48))?;
        let offsets_end = self
            .offsets_offset
            .checked_add(offsets_len)
            .ok_or_else(|| corrupt("offsets section overflows", 56))?;
        if offsets_end != self.file_size {
            return Err(corrupt("offsets section does not end at file end", 56));
        }
        let min_entry = (self.digest_len() + ENTRY_PREFIX_SIZE + LOCATION_SIZE) as u64;
        let index_len = self.offsets_offset - self.index_offset;
        if self.entry_count.saturating_mul(min_entry) > index_len {
            return Err(corrupt("entry count exceeds index size", 48));
        }
        if self.cell_count < self.entry_count {
            return Err(corrupt("fewer cells than entries", 64));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub source_rows: u64,
    pub encoded_rows: u64,
    pub columns: Vec<ColumnSchema>,
}

/// Interned table and column names; `Location` ids index into it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NameTable {
    pub tables: Vec<TableInfo>,
}

impl NameTable {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.tables.len() as u32).to_le_bytes());
        for table in &self.tables {
            put_str(&mut out, &table.name);
            out.extend_from_slice(&table.source_rows.to_le_bytes());
            out.extend_from_slice(&table.encoded_rows.to_le_bytes());
            out.extend_from_slice(&(table.columns.len() as u32).to_le_bytes());
            for column in &table.columns {
                put_str(&mut out, &column.name);
                put_str(&mut out, &column.declared_type);
            }
        }
        out
    }

    /// `base` is the file offset of `buf[0]`, used only for error reporting.
    pub fn decode(buf: &[u8], base: u64) -> Result<Self, Error> {
        let mut cursor = ByteCursor { buf, pos: 0, base };
        let table_count = cursor.u32()?;
        let mut tables = Vec::new();
        for _ in 0..table_count {
            let name = cursor.str()?;
            let source_rows = cursor.u64()?;
            let encoded_rows = cursor.u64()?;
            if encoded_rows > source_rows {
                return Err(cursor.error("encoded rows exceed source rows"));
            }
            let column_count = cursor.u32()?;
            let mut columns = Vec::new();
            for _ in 0..column_count {
                let name = cursor.str()?;
                let declared_type = cursor.str()?;
                columns.push(ColumnSchema {
                    name,
                    declared_type,
                });
            }
            tables.push(TableInfo {
                name,
                source_rows,
                encoded_rows,
                columns,
            });
        }
        if cursor.pos != buf.len() {
            return Err(cursor.error("trailing bytes in names section"));
        }
        Ok(Self { tables })
    }

    pub fn column(&self, table_id: u32, column_id: u32) -> Option<(&TableInfo, &ColumnSchema)> {
        let table = self.tables.get(table_id as usize)?;
        let column = table.columns.get(column_id as usize)?;
        Some((table, column))
    }
}

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> ByteCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.error("names section truncated"))?;
        let buf: &'a [u8] = self.buf;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, Error> {
        Ok(read_u32(self.take(4)?, 0))
    }

    fn u64(&mut self) -> Result<u64, Error> {
        Ok(read_u64(self.take(8)?, 0))
    }

    fn str(&mut self) -> Result<String, Error> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|err| self.error("name is not utf-8").with_source(err))
    }

    fn error(&self, message: &str) -> Error {
        corrupt(message, self.base + self.pos as u64)
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

pub(crate) fn corrupt(message: impl Into<String>, offset: u64) -> Error {
    Error::new(ErrorKind::Format)
        .with_message(message)
        .with_offset(offset)
}

pub fn format_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Format)
        .with_message(format!(
            "unsupported encoded file version {detected} (supported: {supported})"
        ))
        .with_offset(4)
        .with_hint("Re-encode the database with this version of find-relations.")
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
