//! Purpose: Model the relational input the encoder reads from.
//! Exports: `CellValue`, `ColumnSchema`, `TableSchema`, `Source`, `MemorySource`.
//! Role: Seam between the encoder and a concrete database engine.
//! Invariants: `scan` visits rows in a stable order; ordinals start at 0 and are dense.
//! Invariants: Every row passed to a visitor has one value per schema column.
use crate::core::error::{Error, ErrorKind};

/// A single typed cell as read from the source.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        CellValue::Text(value.into().into_bytes())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub declared_type: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

pub type RowVisitor<'a> = dyn FnMut(u64, &[CellValue]) -> Result<(), Error> + 'a;

pub trait Source {
    fn tables(&self) -> Result<Vec<TableSchema>, Error>;

    fn row_count(&self, table: &TableSchema) -> Result<u64, Error>;

    /// Streams every row of `table` to `visit`; a visitor error stops the scan and is returned.
    fn scan(&self, table: &TableSchema, visit: &mut RowVisitor<'_>) -> Result<(), Error>;
}

#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    tables: Vec<(TableSchema, Vec<Vec<CellValue>>)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        name: &str,
        columns: &[(&str, &str)],
        rows: Vec<Vec<CellValue>>,
    ) -> Self {
        let schema = TableSchema {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(name, declared_type)| ColumnSchema {
                    name: name.to_string(),
                    declared_type: declared_type.to_string(),
                })
                .collect(),
        };
        self.tables.push((schema, rows));
        self
    }

    fn rows(&self, table: &TableSchema) -> Result<&[Vec<CellValue>], Error> {
        self.tables
            .iter()
            .find(|(schema, _)| schema.name == table.name)
            .map(|(_, rows)| rows.as_slice())
            .ok_or_else(|| {
                Error::new(ErrorKind::SourceRead)
                    .with_message(format!("no such table '{}'", table.name))
            })
    }
}

impl Source for MemorySource {
    fn tables(&self) -> Result<Vec<TableSchema>, Error> {
        Ok(self.tables.iter().map(|(schema, _)| schema.clone()).collect())
    }

    fn row_count(&self, table: &TableSchema) -> Result<u64, Error> {
        Ok(self.rows(table)?.len() as u64)
    }

    fn scan(&self, table: &TableSchema, visit: &mut RowVisitor<'_>) -> Result<(), Error> {
        for (ordinal, row) in self.rows(table)?.iter().enumerate() {
            if row.len() != table.columns.len() {
                return Err(Error::new(ErrorKind::SourceRead).with_message(format!(
                    "row {ordinal} of '{}' has {} values for {} columns",
                    table.name,
                    row.len(),
                    table.columns.len()
                )));
            }
            visit(ordinal as u64, row)?;
        }
        Ok(())
    }
}
