//! Purpose: SQLite-backed `Source`.
//! Exports: `SqliteSource`.
//! Role: Read-only connection that lists tables in catalogue order and streams rows.
//! Invariants: Every cell keeps its own storage class, whatever the declared column type.
//! Invariants: Failures surface as `SourceRead` with the database path attached.
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::core::error::{Error, ErrorKind};
use crate::core::source::{CellValue, ColumnSchema, RowVisitor, Source, TableSchema};

pub struct SqliteSource {
    path: PathBuf,
    conn: Connection,
}

impl SqliteSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::new(ErrorKind::SourceRead)
                .with_message("database file does not exist")
                .with_path(&path));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| source_error(&path, "failed to open database", err))?;
        Ok(Self { path, conn })
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnSchema>, Error> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| source_error(&self.path, "failed to read table columns", err))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ColumnSchema {
                    name: row.get::<_, String>(1)?,
                    declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })
            .map_err(|err| source_error(&self.path, "failed to read table columns", err))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|err| source_error(&self.path, "failed to read table columns", err))
    }
}

impl Source for SqliteSource {
    fn tables(&self) -> Result<Vec<TableSchema>, Error> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
            )
            .map_err(|err| source_error(&self.path, "failed to list tables", err))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|err| source_error(&self.path, "failed to list tables", err))?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = self.columns(&name)?;
            tables.push(TableSchema { name, columns });
        }
        Ok(tables)
    }

    fn row_count(&self, table: &TableSchema) -> Result<u64, Error> {
        let sql = format!("SELECT count(*) FROM {}", quote_ident(&table.name));
        self.conn
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|count| count.max(0) as u64)
            .map_err(|err| source_error(&self.path, "failed to count rows", err))
    }

    fn scan(&self, table: &TableSchema, visit: &mut RowVisitor<'_>) -> Result<(), Error> {
        let sql = format!("SELECT * FROM {}", quote_ident(&table.name));
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| source_error(&self.path, "failed to scan table", err))?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query([])
            .map_err(|err| source_error(&self.path, "failed to scan table", err))?;
        let mut values = Vec::with_capacity(column_count);
        let mut ordinal = 0u64;
        while let Some(row) = rows
            .next()
            .map_err(|err| source_error(&self.path, "failed to read row", err))?
        {
            values.clear();
            for index in 0..column_count {
                let value = row
                    .get_ref(index)
                    .map_err(|err| source_error(&self.path, "failed to read cell", err))?;
                values.push(cell_value(value));
            }
            visit(ordinal, &values)?;
            ordinal += 1;
        }
        Ok(())
    }
}

fn cell_value(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(v) => CellValue::Integer(v),
        ValueRef::Real(v) => CellValue::Real(v),
        ValueRef::Text(bytes) => CellValue::Text(bytes.to_vec()),
        ValueRef::Blob(bytes) => CellValue::Blob(bytes.to_vec()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn source_error(path: &Path, message: &str, err: rusqlite::Error) -> Error {
    Error::new(ErrorKind::SourceRead)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::{SqliteSource, quote_ident};
    use crate::core::error::ErrorKind;
    use crate::core::source::{CellValue, Source};

    #[test]
    fn reads_tables_columns_and_typed_cells() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.db");
        let conn = Connection::open(&path).expect("create db");
        conn.execute_batch(
            "CREATE TABLE \"odd \"\"name\" (id INTEGER, v);
             INSERT INTO \"odd \"\"name\" VALUES (1, 'x'), (2, 2.5), (3, NULL), (4, x'00ff');",
        )
        .expect("seed");
        drop(conn);

        let source = SqliteSource::open(&path).expect("open");
        let tables = source.tables().expect("tables");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "odd \"name");
        assert_eq!(tables[0].columns[0].declared_type, "INTEGER");
        assert_eq!(tables[0].columns[1].declared_type, "");
        assert_eq!(source.row_count(&tables[0]).expect("count"), 4);

        let mut seen = Vec::new();
        source
            .scan(&tables[0], &mut |row, values| {
                seen.push((row, values[1].clone()));
                Ok(())
            })
            .expect("scan");
        assert_eq!(
            seen,
            vec![
                (0, CellValue::text("x")),
                (1, CellValue::Real(2.5)),
                (2, CellValue::Null),
                (3, CellValue::Blob(vec![0x00, 0xff])),
            ]
        );
    }

    #[test]
    fn missing_database_is_source_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SqliteSource::open(dir.path().join("missing.db"))
            .err()
            .expect("missing");
        assert_eq!(err.kind(), ErrorKind::SourceRead);
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
