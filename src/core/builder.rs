//! Purpose: Encode a relational source into a sorted digest index file.
//! Exports: `encode`, `EncodeOptions`, `EncodeSummary`, `default_output_path`.
//! Role: Streams cells through canonicalization and hashing into a bounded map,
//!       spills sorted segments, and merges them into the final file.
//! Invariants: Options are validated before the source is touched.
//! Invariants: Peak map memory is bounded by `memory_budget`, not by database size.
//! Invariants: The destination is only ever replaced by a complete, synced file.
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::TempDir;

use crate::core::canonical::canonicalize_into;
use crate::core::digest::{DEFAULT_ALGORITHM, Digest, HashAlgorithm};
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    ENTRY_PREFIX_SIZE, FileHeader, HEADER_SIZE, LOCATION_SIZE, Location, NameTable, OFFSET_SIZE,
    TableInfo,
};
use crate::core::sample::{RowSampler, RowSelection};
use crate::core::source::{Source, TableSchema};
use crate::core::spill::{Merger, Run, SegmentReader, write_segment};

pub const DEFAULT_MEMORY_BUDGET: usize = 64 * 1024 * 1024;
/// Estimated map bookkeeping per distinct digest, on top of the digest bytes.
const GROUP_OVERHEAD: usize = 64;

#[derive(Clone, Debug)]
pub struct EncodeOptions {
    pub algorithm: HashAlgorithm,
    pub ignore_types: bool,
    pub sample_size: Option<u64>,
    pub seed: Option<u64>,
    pub memory_budget: usize,
    pub spill_dir: Option<PathBuf>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            algorithm: DEFAULT_ALGORITHM,
            ignore_types: false,
            sample_size: None,
            seed: None,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            spill_dir: None,
            cancel: None,
        }
    }
}

impl EncodeOptions {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.sample_size == Some(0) {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("sample size must be at least 1"));
        }
        if self.memory_budget == 0 {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("memory budget must be greater than zero"));
        }
        if let Some(dir) = &self.spill_dir {
            if !dir.is_dir() {
                return Err(Error::new(ErrorKind::Configuration)
                    .with_message("spill directory does not exist")
                    .with_path(dir));
            }
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncodeSummary {
    pub output: PathBuf,
    pub tables: usize,
    pub cells: u64,
    pub entries: u64,
    pub spilled_segments: usize,
}

/// `db.sqlite` -> `db.sqlite.dat`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(".dat");
    PathBuf::from(name)
}

pub fn encode(
    source: &dyn Source,
    output: &Path,
    options: &EncodeOptions,
) -> Result<EncodeSummary, Error> {
    options.validate()?;
    let output_dir = output_parent(output)?;

    let schemas = source.tables()?;
    let mut sampler = RowSampler::new(options.seed);
    let mut names = NameTable::default();
    let mut selections = Vec::with_capacity(schemas.len());
    for schema in &schemas {
        let source_rows = source.row_count(schema)?;
        let selection = sampler.select(source_rows, options.sample_size);
        names.tables.push(TableInfo {
            name: schema.name.clone(),
            source_rows,
            encoded_rows: selection.len(source_rows),
            columns: schema.columns.clone(),
        });
        selections.push(selection);
    }

    let spill_dir = make_spill_dir(options.spill_dir.as_deref())?;
    let mut accumulator = Accumulator::new(
        spill_dir.path(),
        options.algorithm.output_len(),
        options.memory_budget,
    );
    for (table_id, (schema, selection)) in schemas.iter().zip(&selections).enumerate() {
        if options.cancelled() {
            return Err(interrupted(&schema.name));
        }
        let expected_rows = names.tables[table_id].encoded_rows;
        tracing::info!(table = %schema.name, rows = expected_rows, "encoding table");
        let table_id = u32::try_from(table_id).map_err(|_| {
            Error::new(ErrorKind::SourceRead).with_message("too many tables to encode")
        })?;
        let encoded_rows = encode_table(source, schema, table_id, selection, options, &mut accumulator)?;
        if encoded_rows != expected_rows {
            return Err(Error::new(ErrorKind::SourceRead)
                .with_message(format!(
                    "table '{}' changed during encode (expected {expected_rows} rows, read {encoded_rows})",
                    schema.name
                ))
                .with_hint("Encode from a database that is not being written to."));
        }
    }
    if options.cancelled() {
        return Err(interrupted("index write"));
    }

    let mut header = FileHeader::new(options.algorithm, options.ignore_types, options.sample_size);
    let spilled_segments = accumulator.segments.len();
    let runs = accumulator.into_runs()?;
    let temp = write_index(&output_dir, spill_dir.path(), &mut header, &names, runs)?;
    temp.persist(output).map_err(|err| {
        Error::new(ErrorKind::Resource)
            .with_message("failed to move encoded file into place")
            .with_path(output)
            .with_source(err.error)
    })?;

    tracing::info!(
        output = %output.display(),
        entries = header.entry_count,
        cells = header.cell_count,
        "encoded database"
    );
    Ok(EncodeSummary {
        output: output.to_path_buf(),
        tables: names.tables.len(),
        cells: header.cell_count,
        entries: header.entry_count,
        spilled_segments,
    })
}

fn encode_table(
    source: &dyn Source,
    schema: &TableSchema,
    table_id: u32,
    selection: &RowSelection,
    options: &EncodeOptions,
    accumulator: &mut Accumulator,
) -> Result<u64, Error> {
    let mut filter = selection.filter();
    let mut canonical = Vec::new();
    let mut encoded_rows = 0u64;
    source.scan(schema, &mut |row, values| {
        if !filter.accepts(row) {
            return Ok(());
        }
        if values.len() != schema.columns.len() {
            return Err(Error::new(ErrorKind::SourceRead).with_message(format!(
                "row {row} of '{}' has {} values for {} columns",
                schema.name,
                values.len(),
                schema.columns.len()
            )));
        }
        for (column_id, value) in values.iter().enumerate() {
            canonicalize_into(value, options.ignore_types, &mut canonical);
            let digest = options.algorithm.digest(&canonical);
            accumulator.insert(digest, Location::new(table_id, column_id as u32, row))?;
        }
        encoded_rows += 1;
        Ok(())
    })?;
    Ok(encoded_rows)
}

struct Accumulator {
    dir: PathBuf,
    map: BTreeMap<Digest, Vec<Location>>,
    bytes: usize,
    budget: usize,
    digest_len: usize,
    segments: Vec<PathBuf>,
}

impl Accumulator {
    fn new(dir: &Path, digest_len: usize, budget: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            map: BTreeMap::new(),
            bytes: 0,
            budget,
            digest_len,
            segments: Vec::new(),
        }
    }

    fn insert(&mut self, digest: Digest, location: Location) -> Result<(), Error> {
        match self.map.entry(digest) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(location);
                self.bytes += LOCATION_SIZE;
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![location]);
                self.bytes += self.digest_len + GROUP_OVERHEAD + LOCATION_SIZE;
            }
        }
        if self.bytes > self.budget {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<(), Error> {
        let path = self.dir.join(format!("segment-{:06}", self.segments.len()));
        let groups = std::mem::take(&mut self.map);
        let written = write_segment(&path, groups)?;
        tracing::debug!(
            segment = self.segments.len(),
            groups = written,
            bytes = self.bytes,
            "spilled index segment"
        );
        self.segments.push(path);
        self.bytes = 0;
        Ok(())
    }

    // TODO: cascade merges once the segment count nears the open-file limit.
    fn into_runs(self) -> Result<Vec<Run>, Error> {
        let mut runs = Vec::with_capacity(self.segments.len() + 1);
        for path in &self.segments {
            runs.push(Run::Segment(SegmentReader::open(path, self.digest_len)?));
        }
        runs.push(Run::Memory(self.map.into_iter()));
        Ok(runs)
    }
}

/// Writes the complete file to a temp path next to the destination and returns it unpersisted.
fn write_index(
    output_dir: &Path,
    spill_dir: &Path,
    header: &mut FileHeader,
    names: &NameTable,
    runs: Vec<Run>,
) -> Result<tempfile::NamedTempFile, Error> {
    let mut temp = tempfile::Builder::new()
        .prefix(".find-relations-")
        .suffix(".tmp")
        .tempfile_in(output_dir)
        .map_err(|err| write_error(output_dir, err))?;
    let temp_path = temp.path().to_path_buf();
    let offsets_path = spill_dir.join("offsets");

    {
        let mut writer = BufWriter::new(&mut temp);
        let mut offsets = BufWriter::new(
            File::create(&offsets_path).map_err(|err| write_error(&offsets_path, err))?,
        );
        let names_bytes = names.encode();
        writer
            .write_all(&[0u8; HEADER_SIZE])
            .and_then(|_| writer.write_all(&names_bytes))
            .map_err(|err| write_error(&temp_path, err))?;

        header.names_offset = HEADER_SIZE as u64;
        header.names_len = names_bytes.len() as u64;
        header.index_offset = header.names_offset + header.names_len;

        let entry_fixed = (header.digest_len() + ENTRY_PREFIX_SIZE) as u64;
        let mut pos = header.index_offset;
        let mut previous: Option<Digest> = None;
        let mut merger = Merger::new(runs)?;
        while let Some(group) = merger.write_next(&mut writer, &temp_path)? {
            if previous.as_ref().is_some_and(|prev| *prev >= group.digest) {
                return Err(Error::new(ErrorKind::Internal)
                    .with_message("merged digests out of order"));
            }
            offsets
                .write_all(&pos.to_le_bytes())
                .map_err(|err| write_error(&offsets_path, err))?;
            pos += entry_fixed + group.count as u64 * LOCATION_SIZE as u64;
            header.entry_count += 1;
            header.cell_count += group.count as u64;
            previous = Some(group.digest);
        }
        tracing::debug!(entries = header.entry_count, "merged index segments");

        offsets
            .flush()
            .map_err(|err| write_error(&offsets_path, err))?;
        drop(offsets);
        header.offsets_offset = pos;
        let mut offsets = File::open(&offsets_path).map_err(|err| write_error(&offsets_path, err))?;
        let copied = io::copy(&mut offsets, &mut writer).map_err(|err| write_error(&temp_path, err))?;
        if copied != header.entry_count * OFFSET_SIZE as u64 {
            return Err(Error::new(ErrorKind::Internal).with_message("offset table size mismatch"));
        }
        header.file_size = pos + copied;
        writer.flush().map_err(|err| write_error(&temp_path, err))?;
    }

    temp.seek(SeekFrom::Start(0))
        .and_then(|_| temp.write_all(&header.encode()))
        .and_then(|_| temp.flush())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| write_error(&temp_path, err))?;
    Ok(temp)
}

fn output_parent(output: &Path) -> Result<PathBuf, Error> {
    if output.is_dir() {
        return Err(Error::new(ErrorKind::Configuration)
            .with_message("output path is a directory")
            .with_path(output));
    }
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.is_dir() {
        return Err(Error::new(ErrorKind::Configuration)
            .with_message("output directory does not exist")
            .with_path(parent));
    }
    Ok(parent)
}

fn make_spill_dir(base: Option<&Path>) -> Result<TempDir, Error> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("find-relations-spill-");
    let dir = match base {
        Some(base) => builder.tempdir_in(base),
        None => builder.tempdir(),
    };
    dir.map_err(|err| {
        Error::new(ErrorKind::Resource)
            .with_message("failed to create spill directory")
            .with_source(err)
    })
}

fn write_error(path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Resource)
        .with_message("failed to write encoded file")
        .with_path(path)
        .with_source(err)
}

fn interrupted(at: &str) -> Error {
    Error::new(ErrorKind::Interrupted)
        .with_message(format!("encode cancelled before {at}"))
        .with_hint("No output was written; rerun encode to completion.")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::{EncodeOptions, default_output_path, encode};
    use crate::core::digest::HashAlgorithm;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::source::{CellValue, MemorySource, RowVisitor, Source, TableSchema};

    fn source() -> MemorySource {
        let users = (0..20)
            .map(|i| {
                vec![
                    CellValue::Integer(i),
                    CellValue::text(format!("user{}@x.com", i % 7)),
                    if i % 3 == 0 { CellValue::Null } else { CellValue::Real(i as f64 / 2.0) },
                ]
            })
            .collect();
        let orders = (0..30)
            .map(|i| vec![CellValue::Integer(i % 20), CellValue::text(format!("user{}@x.com", i % 5))])
            .collect();
        MemorySource::new()
            .with_table(
                "users",
                &[("id", "INTEGER"), ("email", "TEXT"), ("score", "REAL")],
                users,
            )
            .with_table("orders", &[("user_id", "INTEGER"), ("email", "TEXT")], orders)
    }

    #[test]
    fn spilling_does_not_change_output_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let in_memory = dir.path().join("a.dat");
        let spilled = dir.path().join("b.dat");

        let summary = encode(&source(), &in_memory, &EncodeOptions::default()).expect("encode");
        assert_eq!(summary.spilled_segments, 0);
        assert_eq!(summary.cells, 20 * 3 + 30 * 2);

        let options = EncodeOptions {
            memory_budget: 512,
            ..EncodeOptions::default()
        };
        let summary = encode(&source(), &spilled, &options).expect("encode spilled");
        assert!(summary.spilled_segments > 1);

        let a = std::fs::read(&in_memory).expect("read a");
        let b = std::fs::read(&spilled).expect("read b");
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_options_fail_before_touching_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.dat");
        let options = EncodeOptions {
            sample_size: Some(0),
            ..EncodeOptions::new(HashAlgorithm::Sha1)
        };
        let err = encode(&source(), &output, &options).expect_err("sample 0");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!output.exists());

        let missing = dir.path().join("nope").join("out.dat");
        let err = encode(&source(), &missing, &EncodeOptions::default()).expect_err("no dir");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    struct FailingSource {
        inner: MemorySource,
    }

    impl Source for FailingSource {
        fn tables(&self) -> Result<Vec<TableSchema>, Error> {
            self.inner.tables()
        }

        fn row_count(&self, table: &TableSchema) -> Result<u64, Error> {
            self.inner.row_count(table)
        }

        fn scan(&self, table: &TableSchema, visit: &mut RowVisitor<'_>) -> Result<(), Error> {
            if table.name == "orders" {
                return Err(Error::new(ErrorKind::SourceRead).with_message("disk image is malformed"));
            }
            self.inner.scan(table, visit)
        }
    }

    #[test]
    fn source_failure_leaves_existing_output_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.dat");
        std::fs::write(&output, b"previous").expect("seed output");

        let failing = FailingSource { inner: source() };
        let err = encode(&failing, &output, &EncodeOptions::default()).expect_err("fail");
        assert_eq!(err.kind(), ErrorKind::SourceRead);
        assert_eq!(std::fs::read(&output).expect("read"), b"previous");

        let leftovers = std::fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn cancellation_stops_at_table_boundary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.dat");
        let options = EncodeOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..EncodeOptions::default()
        };
        let err = encode(&source(), &output, &options).expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert!(!output.exists());
    }

    #[test]
    fn common_value_spread_over_many_segments_merges_into_one_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rows = (0..400)
            .map(|i| vec![CellValue::Null, CellValue::Integer(i), CellValue::Null])
            .collect();
        let source = MemorySource::new().with_table(
            "sparse",
            &[("a", "TEXT"), ("n", "INTEGER"), ("b", "TEXT")],
            rows,
        );

        let in_memory = dir.path().join("a.dat");
        let summary = encode(&source, &in_memory, &EncodeOptions::default()).expect("encode");
        assert_eq!(summary.spilled_segments, 0);
        assert_eq!(summary.entries, 401);

        let spilled = dir.path().join("b.dat");
        let options = EncodeOptions {
            memory_budget: 512,
            ..EncodeOptions::default()
        };
        let summary = encode(&source, &spilled, &options).expect("encode spilled");
        assert!(summary.spilled_segments > 10);
        assert_eq!(summary.cells, 1200);

        assert_eq!(
            std::fs::read(&in_memory).expect("read a"),
            std::fs::read(&spilled).expect("read b")
        );
        let file = crate::core::reader::EncodedFile::open(&spilled).expect("open");
        let nulls = file
            .lookup(file.null_digest())
            .expect("lookup")
            .expect("null entry");
        assert_eq!(nulls.len(), 800);
    }

    #[test]
    fn default_output_appends_dat() {
        assert_eq!(
            default_output_path(std::path::Path::new("/tmp/shop.db")),
            std::path::PathBuf::from("/tmp/shop.db.dat")
        );
    }
}
