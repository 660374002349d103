//! Purpose: Read-only access to encoded index files.
//! Exports: `EncodedFile`, `IndexEntry`, `CellLookup`.
//! Role: Validates the header, then serves digest -> locations (binary search) and
//!       location -> digest (linear scan) lookups over a memory map.
//! Invariants: The file is immutable once opened; no method mutates it.
//! Invariants: Every slice handed out is bounds-checked; corruption surfaces as `Format`.
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::core::canonical::canonicalize;
use crate::core::digest::{Digest, HashAlgorithm};
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    ENTRY_PREFIX_SIZE, FileHeader, HEADER_SIZE, LOCATION_SIZE, Location, NameTable, OFFSET_SIZE,
    TableInfo, corrupt, read_u32, read_u64,
};
use crate::core::source::{CellValue, ColumnSchema};

pub struct EncodedFile {
    path: PathBuf,
    mmap: Mmap,
    header: FileHeader,
    names: NameTable,
    null_digest: Digest,
}

/// One digest and the locations that share it, borrowed from the map.
#[derive(Clone, Copy, Debug)]
pub struct IndexEntry<'a> {
    digest: &'a [u8],
    locations: &'a [u8],
}

impl<'a> IndexEntry<'a> {
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(self.digest)
    }

    pub fn digest_bytes(&self) -> &'a [u8] {
        self.digest
    }

    pub fn len(&self) -> usize {
        self.locations.len() / LOCATION_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn locations(&self) -> impl Iterator<Item = Location> + use<'a> {
        self.locations.chunks_exact(LOCATION_SIZE).map(Location::decode)
    }

    pub fn contains(&self, location: &Location) -> bool {
        self.locations().any(|candidate| candidate == *location)
    }

    pub fn touches_column(&self, table_id: u32, column_id: u32) -> bool {
        self.locations()
            .any(|location| location.same_column(table_id, column_id))
    }
}

/// Result of resolving a cell coordinate: its digest and every other location sharing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CellLookup {
    pub digest: Digest,
    pub siblings: Vec<Location>,
}

impl EncodedFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|err| {
            Error::new(ErrorKind::Resource)
                .with_message("failed to open encoded file")
                .with_hint("Create it with `find-relations encode`.")
                .with_path(&path)
                .with_source(err)
        })?;
        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Resource).with_path(&path).with_source(err))?;
        if actual_size < HEADER_SIZE as u64 {
            return Err(corrupt("file too small for header", 0).with_path(&path));
        }

        let mmap = unsafe {
            Mmap::map(&file)
                .map_err(|err| Error::new(ErrorKind::Resource).with_path(&path).with_source(err))?
        };
        let header = FileHeader::decode(&mmap[..HEADER_SIZE]).map_err(|err| err.with_path(&path))?;
        header.validate(actual_size).map_err(|err| err.with_path(&path))?;

        let names_start = header.names_offset as usize;
        let names_end = names_start + header.names_len as usize;
        let names = NameTable::decode(&mmap[names_start..names_end], header.names_offset)
            .map_err(|err| err.with_path(&path))?;
        let null_digest = header
            .algorithm
            .digest(&canonicalize(&CellValue::Null, header.ignore_types));

        tracing::debug!(
            path = %path.display(),
            algorithm = %header.algorithm,
            entries = header.entry_count,
            "opened encoded file"
        );
        Ok(Self {
            path,
            mmap,
            header,
            names,
            null_digest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.header.algorithm
    }

    pub fn ignore_types(&self) -> bool {
        self.header.ignore_types
    }

    pub fn sample_size(&self) -> Option<u64> {
        self.header.sample_size
    }

    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    pub fn cell_count(&self) -> u64 {
        self.header.cell_count
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.names.tables
    }

    pub fn null_digest(&self) -> &Digest {
        &self.null_digest
    }

    /// Digest of a value under this file's algorithm and type policy.
    pub fn digest_value(&self, value: &CellValue) -> Digest {
        self.header
            .algorithm
            .digest(&canonicalize(value, self.header.ignore_types))
    }

    pub fn column(&self, location: &Location) -> Result<(&TableInfo, &ColumnSchema), Error> {
        self.names
            .column(location.table_id, location.column_id)
            .ok_or_else(|| {
                self.corrupt(format!(
                    "location references unknown column {}:{}",
                    location.table_id, location.column_id
                ), self.header.index_offset)
            })
    }

    pub fn entry(&self, index: u64) -> Result<IndexEntry<'_>, Error> {
        if index >= self.header.entry_count {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("entry {index} out of range")));
        }
        let slot = self.header.offsets_offset + index * OFFSET_SIZE as u64;
        let offset = read_u64(&self.mmap, slot as usize);
        self.entry_at(offset)
    }

    fn entry_at(&self, offset: u64) -> Result<IndexEntry<'_>, Error> {
        let digest_len = self.header.digest_len();
        let limit = self.header.offsets_offset;
        let fixed_end = offset.checked_add((digest_len + ENTRY_PREFIX_SIZE) as u64);
        let Some(fixed_end) = fixed_end.filter(|end| offset >= self.header.index_offset && *end <= limit) else {
            return Err(self.corrupt("entry offset out of bounds", offset));
        };
        let start = offset as usize;
        let digest = &self.mmap[start..start + digest_len];
        let count = read_u32(&self.mmap, start + digest_len) as u64;
        let end = fixed_end + count * LOCATION_SIZE as u64;
        if count == 0 || end > limit {
            return Err(self.corrupt("entry locations out of bounds", offset));
        }
        Ok(IndexEntry {
            digest,
            locations: &self.mmap[fixed_end as usize..end as usize],
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = Result<IndexEntry<'_>, Error>> + '_ {
        (0..self.header.entry_count).map(move |index| self.entry(index))
    }

    /// Binary search over the sorted digest sequence.
    pub fn lookup(&self, digest: &Digest) -> Result<Option<IndexEntry<'_>>, Error> {
        if digest.len() != self.header.digest_len() {
            return Ok(None);
        }
        let (mut lo, mut hi) = (0u64, self.header.entry_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = self.entry(mid)?;
            match entry.digest_bytes().cmp(digest.as_bytes()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
            }
        }
        Ok(None)
    }

    /// Case-insensitive table name lookup.
    pub fn resolve_table(&self, name: &str) -> Result<u32, Error> {
        self.names
            .tables
            .iter()
            .position(|table| table.name == name)
            .or_else(|| {
                self.names
                    .tables
                    .iter()
                    .position(|table| table.name.eq_ignore_ascii_case(name))
            })
            .map(|index| index as u32)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("table '{name}' is not in the encoded file"))
                    .with_path(&self.path)
            })
    }

    /// Resolves a column by name, falling back to a 1-based column number.
    pub fn resolve_column(&self, table_id: u32, column: &str) -> Result<u32, Error> {
        let table = self.names.tables.get(table_id as usize).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!("table id {table_id} out of range"))
        })?;
        let by_name = table
            .columns
            .iter()
            .position(|c| c.name == column)
            .or_else(|| {
                table
                    .columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(column))
            });
        let by_number = || {
            column
                .parse::<usize>()
                .ok()
                .filter(|n| (1..=table.columns.len()).contains(n))
                .map(|n| n - 1)
        };
        by_name
            .or_else(by_number)
            .map(|index| index as u32)
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!(
                        "column '{column}' does not exist in '{}' ({} columns)",
                        table.name,
                        table.columns.len()
                    ))
                    .with_path(&self.path)
            })
    }

    /// Linear scan for the entry holding `location`.
    pub fn find_location(&self, location: &Location) -> Result<Option<IndexEntry<'_>>, Error> {
        for entry in self.entries() {
            let entry = entry?;
            if entry.contains(location) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Resolves a cell (0-based row) to its digest and the other locations sharing it.
    pub fn locations_for_cell(
        &self,
        table_id: u32,
        row: u64,
        column_id: u32,
    ) -> Result<CellLookup, Error> {
        let location = Location::new(table_id, column_id, row);
        let (table, column) = self.names.column(table_id, column_id).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message("cell coordinate is not in the encoded file")
        })?;
        if row >= table.source_rows {
            return Err(Error::new(ErrorKind::NotFound).with_message(format!(
                "row {} is out of range for '{}' ({} rows)",
                row + 1,
                table.name,
                table.source_rows
            )));
        }
        let Some(entry) = self.find_location(&location)? else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!(
                    "cell '{}' row {} column '{}' was not encoded",
                    table.name,
                    row + 1,
                    column.name
                ))
                .with_hint("The row was likely excluded by --sample at encode time."));
        };
        Ok(CellLookup {
            digest: entry.digest(),
            siblings: entry.locations().filter(|other| *other != location).collect(),
        })
    }

    /// Entries holding at least one cell of (table, column), in index order.
    pub fn column_entries(
        &self,
        table_id: u32,
        column_id: u32,
    ) -> impl Iterator<Item = Result<IndexEntry<'_>, Error>> + '_ {
        self.entries().filter(move |entry| match entry {
            Ok(entry) => entry.touches_column(table_id, column_id),
            Err(_) => true,
        })
    }

    /// Full scan: strict digest order, location bounds, and cell count.
    pub fn verify(&self) -> Result<(), Error> {
        let mut previous: Option<&[u8]> = None;
        let mut cells = 0u64;
        for index in 0..self.header.entry_count {
            let entry = self.entry(index)?;
            if previous.is_some_and(|prev| prev >= entry.digest_bytes()) {
                return Err(self.corrupt(
                    format!("entry {index} breaks digest order"),
                    self.header.offsets_offset + index * OFFSET_SIZE as u64,
                ));
            }
            for location in entry.locations() {
                let (table, _) = self.column(&location)?;
                if location.row >= table.source_rows {
                    return Err(self.corrupt(
                        format!("entry {index} references row beyond '{}'", table.name),
                        self.header.index_offset,
                    ));
                }
            }
            cells += entry.len() as u64;
            previous = Some(entry.digest_bytes());
        }
        if cells != self.header.cell_count {
            return Err(self.corrupt("cell count does not match index", 64));
        }
        Ok(())
    }

    fn corrupt(&self, message: impl Into<String>, offset: u64) -> Error {
        corrupt(message, offset).with_path(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use super::EncodedFile;
    use crate::core::builder::{EncodeOptions, encode};
    use crate::core::digest::HashAlgorithm;
    use crate::core::error::ErrorKind;
    use crate::core::format::Location;
    use crate::core::source::{CellValue, MemorySource};

    fn encoded(ignore_types: bool) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.dat");
        let source = MemorySource::new()
            .with_table(
                "a",
                &[("n", "INTEGER"), ("s", "TEXT")],
                vec![
                    vec![CellValue::Integer(5), CellValue::text("x")],
                    vec![CellValue::Integer(6), CellValue::Null],
                ],
            )
            .with_table("b", &[("s", "TEXT")], vec![vec![CellValue::text("5")]]);
        let options = EncodeOptions {
            ignore_types,
            ..EncodeOptions::new(HashAlgorithm::Sha256)
        };
        encode(&source, &path, &options).expect("encode");
        (dir, path)
    }

    #[test]
    fn every_cell_is_found_by_its_value_digest() {
        let (_dir, path) = encoded(false);
        let file = EncodedFile::open(&path).expect("open");
        file.verify().expect("verify");
        assert_eq!(file.cell_count(), 5);

        let entry = file
            .lookup(&file.digest_value(&CellValue::Integer(6)))
            .expect("lookup")
            .expect("found");
        assert_eq!(entry.locations().collect::<Vec<_>>(), vec![Location::new(0, 0, 1)]);

        let missing = file.lookup(&file.digest_value(&CellValue::text("zzz"))).expect("lookup");
        assert!(missing.is_none());
    }

    #[test]
    fn ignore_types_merges_cross_type_entries() {
        let (_dir, path) = encoded(true);
        let file = EncodedFile::open(&path).expect("open");
        let entry = file
            .lookup(&file.digest_value(&CellValue::Integer(5)))
            .expect("lookup")
            .expect("found");
        assert_eq!(entry.len(), 2);

        let (_dir, path) = encoded(false);
        let file = EncodedFile::open(&path).expect("open");
        let entry = file
            .lookup(&file.digest_value(&CellValue::Integer(5)))
            .expect("lookup")
            .expect("found");
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn cell_resolution_and_not_found() {
        let (_dir, path) = encoded(true);
        let file = EncodedFile::open(&path).expect("open");
        let table = file.resolve_table("B").expect("table");
        let column = file.resolve_column(table, "1").expect("column by number");
        let lookup = file.locations_for_cell(table, 0, column).expect("cell");
        assert_eq!(lookup.siblings, vec![Location::new(0, 0, 0)]);

        let err = file.locations_for_cell(table, 4, column).expect_err("out of range");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = file.resolve_column(table, "missing").expect_err("no column");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = file.resolve_table("c").expect_err("no table");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn corrupt_files_are_format_errors() {
        let (_dir, path) = encoded(false);
        let mut file = OpenOptions::new().write(true).open(&path).expect("open rw");
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.write_all(b"NOPE").expect("write");
        drop(file);
        let err = EncodedFile::open(&path).err().expect("bad magic");
        assert_eq!(err.kind(), ErrorKind::Format);

        let (_dir, path) = encoded(false);
        let len = std::fs::metadata(&path).expect("meta").len();
        let file = OpenOptions::new().write(true).open(&path).expect("open rw");
        file.set_len(len - 3).expect("truncate");
        drop(file);
        let err = EncodedFile::open(&path).err().expect("truncated");
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn missing_file_is_a_resource_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = EncodedFile::open(dir.path().join("absent.dat"))
            .err()
            .expect("missing");
        assert_eq!(err.kind(), ErrorKind::Resource);
    }
}
