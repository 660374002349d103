//! Purpose: Define the stable public Rust API boundary for find-relations.
//! Exports: Encode/search operations and the types they take and return.
//! Role: Additive-only surface used by the CLI and integration tests.
//! Invariants: Spill segments and byte-level codecs stay internal to `core`.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::builder::{
    DEFAULT_MEMORY_BUDGET, EncodeOptions, EncodeSummary, default_output_path, encode,
};
pub use crate::core::canonical::{ValueType, canonicalize, parse_literal};
pub use crate::core::digest::{DEFAULT_ALGORITHM, Digest, HashAlgorithm};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{FileHeader, Location, TableInfo};
pub use crate::core::query::{
    CellMatch, GroupResult, Query, QueryOutcome, QueryReport, Results, SearchRequest, search,
};
pub use crate::core::reader::{CellLookup, EncodedFile, IndexEntry};
pub use crate::core::source::{CellValue, ColumnSchema, MemorySource, RowVisitor, Source, TableSchema};
pub use crate::core::sqlite::SqliteSource;
