//! Purpose: The three search modes (value, cell, column) over an encoded file.
//! Exports: `search`, `Query`, `SearchRequest`, `QueryReport`, `QueryOutcome`, `Results`.
//! Role: Resolves queries to digests, looks them up, applies null/aggregation/limit policy.
//! Invariants: Request-level configuration errors are raised before any lookup.
//! Invariants: A `NotFound` for one query never aborts its siblings.
//! Invariants: Result order is index order; truncation is therefore deterministic.
use std::collections::HashMap;

use serde::Serialize;

use crate::core::canonical::{ValueType, parse_literal};
use crate::core::digest::Digest;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::Location;
use crate::core::reader::EncodedFile;
use crate::core::source::CellValue;

/// Representative rows kept per aggregated group.
pub const GROUP_SAMPLE_ROWS: usize = 3;

/// Rows in queries and results are 1-based.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Query {
    Value { value_type: ValueType, literal: String },
    Cell { table: String, row: u64, column: String },
    Column { table: String, column: String },
}

impl Query {
    pub fn mode(&self) -> &'static str {
        match self {
            Query::Value { .. } => "value",
            Query::Cell { .. } => "cell",
            Query::Column { .. } => "column",
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchRequest {
    pub queries: Vec<Query>,
    pub max_results: Option<usize>,
    pub include_null: bool,
    pub show_all_results: bool,
}

impl SearchRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if self.queries.is_empty() {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("nothing to search for")
                .with_hint("Pass --value, --cell, or --column."));
        }
        if self.max_results == Some(0) {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("--max-results must be at least 1"));
        }
        if self.max_results.is_some() && self.queries.len() > 1 {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("--max-results cannot be combined with multiple queries")
                .with_hint("Run one search per value, or drop --max-results."));
        }
        for query in &self.queries {
            if let Query::Cell { row: 0, .. } = query {
                return Err(Error::new(ErrorKind::Configuration)
                    .with_message("cell rows are 1-based"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CellMatch {
    pub table: String,
    pub column: String,
    pub row: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct GroupResult {
    pub table: String,
    pub column: String,
    pub count: u64,
    pub sample_rows: Vec<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Results {
    Grouped(Vec<GroupResult>),
    Cells(Vec<CellMatch>),
}

impl Results {
    pub fn len(&self) -> usize {
        match self {
            Results::Grouped(groups) => groups.len(),
            Results::Cells(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of individual cells behind the reported units.
    pub fn cell_count(&self) -> u64 {
        match self {
            Results::Grouped(groups) => groups.iter().map(|group| group.count).sum(),
            Results::Cells(cells) => cells.len() as u64,
        }
    }
}

#[derive(Debug)]
pub enum QueryOutcome {
    Searched,
    NullSkipped,
    NotFound(Error),
}

#[derive(Debug)]
pub struct QueryReport {
    pub query: Query,
    pub digest: Option<Digest>,
    pub outcome: QueryOutcome,
    pub results: Results,
    /// Units available before `max_results` truncation.
    pub total: usize,
    pub truncated: bool,
}

impl QueryReport {
    fn empty(query: Query, show_all: bool, outcome: QueryOutcome) -> Self {
        Self {
            query,
            digest: None,
            outcome,
            results: if show_all {
                Results::Cells(Vec::new())
            } else {
                Results::Grouped(Vec::new())
            },
            total: 0,
            truncated: false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.outcome, QueryOutcome::NotFound(_))
    }
}

pub fn search(file: &EncodedFile, request: &SearchRequest) -> Result<Vec<QueryReport>, Error> {
    request.validate()?;
    let literals = request
        .queries
        .iter()
        .map(|query| match query {
            Query::Value {
                value_type,
                literal,
            } => parse_literal(*value_type, literal).map(Some),
            _ => Ok(None),
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut reports = Vec::with_capacity(request.queries.len());
    for (query, literal) in request.queries.iter().zip(literals) {
        let report = match (query, literal) {
            (Query::Value { .. }, Some(value)) => search_value(file, request, query, &value),
            (Query::Cell { table, row, column }, _) => {
                search_cell(file, request, query, table, *row, column)
            }
            (Query::Column { table, column }, _) => search_column(file, request, query, table, column),
            (Query::Value { .. }, None) => Err(Error::new(ErrorKind::Internal)
                .with_message("value query without parsed literal")),
        };
        let report = match report {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(mode = query.mode(), error = %err, "query not found");
                QueryReport::empty(query.clone(), request.show_all_results, QueryOutcome::NotFound(err))
            }
            other => other?,
        };
        reports.push(report);
    }
    Ok(reports)
}

fn search_value(
    file: &EncodedFile,
    request: &SearchRequest,
    query: &Query,
    value: &CellValue,
) -> Result<QueryReport, Error> {
    if value.is_null() && !request.include_null {
        return Ok(QueryReport::empty(
            query.clone(),
            request.show_all_results,
            QueryOutcome::NullSkipped,
        ));
    }
    let digest = file.digest_value(value);
    let mut collector = Collector::new(request.show_all_results);
    if let Some(entry) = file.lookup(&digest)? {
        for location in entry.locations() {
            collector.push(file, &location)?;
        }
    }
    Ok(collector.finish(query.clone(), Some(digest), request.max_results))
}

fn search_cell(
    file: &EncodedFile,
    request: &SearchRequest,
    query: &Query,
    table: &str,
    row: u64,
    column: &str,
) -> Result<QueryReport, Error> {
    let table_id = file.resolve_table(table)?;
    let column_id = file.resolve_column(table_id, column)?;
    let lookup = file.locations_for_cell(table_id, row - 1, column_id)?;
    if lookup.digest == *file.null_digest() && !request.include_null {
        let mut report = QueryReport::empty(
            query.clone(),
            request.show_all_results,
            QueryOutcome::NullSkipped,
        );
        report.digest = Some(lookup.digest);
        return Ok(report);
    }
    let mut collector = Collector::new(request.show_all_results);
    for location in &lookup.siblings {
        collector.push(file, location)?;
    }
    Ok(collector.finish(query.clone(), Some(lookup.digest), request.max_results))
}

fn search_column(
    file: &EncodedFile,
    request: &SearchRequest,
    query: &Query,
    table: &str,
    column: &str,
) -> Result<QueryReport, Error> {
    let table_id = file.resolve_table(table)?;
    let column_id = file.resolve_column(table_id, column)?;
    let null_digest = file.null_digest().as_bytes();
    let mut collector = Collector::new(request.show_all_results);
    for entry in file.column_entries(table_id, column_id) {
        let entry = entry?;
        if !request.include_null && entry.digest_bytes() == null_digest {
            continue;
        }
        for location in entry.locations() {
            if !location.same_column(table_id, column_id) {
                collector.push(file, &location)?;
            }
        }
    }
    Ok(collector.finish(query.clone(), None, request.max_results))
}

struct Collector {
    show_all: bool,
    cells: Vec<CellMatch>,
    groups: Vec<GroupResult>,
    group_index: HashMap<(u32, u32), usize>,
}

impl Collector {
    fn new(show_all: bool) -> Self {
        Self {
            show_all,
            cells: Vec::new(),
            groups: Vec::new(),
            group_index: HashMap::new(),
        }
    }

    fn push(&mut self, file: &EncodedFile, location: &Location) -> Result<(), Error> {
        let (table, column) = file.column(location)?;
        let row = location.row + 1;
        if self.show_all {
            self.cells.push(CellMatch {
                table: table.name.clone(),
                column: column.name.clone(),
                row,
            });
            return Ok(());
        }
        let key = (location.table_id, location.column_id);
        let index = *self.group_index.entry(key).or_insert_with(|| {
            self.groups.push(GroupResult {
                table: table.name.clone(),
                column: column.name.clone(),
                count: 0,
                sample_rows: Vec::new(),
            });
            self.groups.len() - 1
        });
        let group = &mut self.groups[index];
        group.count += 1;
        if group.sample_rows.len() < GROUP_SAMPLE_ROWS {
            group.sample_rows.push(row);
        }
        Ok(())
    }

    fn finish(self, query: Query, digest: Option<Digest>, max_results: Option<usize>) -> QueryReport {
        let limit = max_results.unwrap_or(usize::MAX);
        let (results, total) = if self.show_all {
            let total = self.cells.len();
            let mut cells = self.cells;
            cells.truncate(limit);
            (Results::Cells(cells), total)
        } else {
            let total = self.groups.len();
            let mut groups = self.groups;
            groups.truncate(limit);
            (Results::Grouped(groups), total)
        };
        QueryReport {
            query,
            digest,
            outcome: QueryOutcome::Searched,
            truncated: results.len() < total,
            results,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GroupResult, Query, QueryOutcome, Results, SearchRequest, search};
    use crate::core::builder::{EncodeOptions, encode};
    use crate::core::canonical::ValueType;
    use crate::core::error::ErrorKind;
    use crate::core::reader::EncodedFile;
    use crate::core::source::{CellValue, MemorySource};

    fn shop(ignore_types: bool) -> (tempfile::TempDir, EncodedFile) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shop.dat");
        let source = MemorySource::new()
            .with_table(
                "users",
                &[("id", "INTEGER"), ("email", "TEXT"), ("nick", "TEXT")],
                vec![
                    vec![CellValue::Integer(1), CellValue::text("a@x.com"), CellValue::Null],
                    vec![CellValue::Integer(2), CellValue::text("b@x.com"), CellValue::text("bee")],
                ],
            )
            .with_table(
                "orders",
                &[("id", "INTEGER"), ("user_email", "TEXT"), ("note", "TEXT")],
                vec![
                    vec![CellValue::Integer(1), CellValue::text("a@x.com"), CellValue::Null],
                    vec![CellValue::Integer(2), CellValue::text("a@x.com"), CellValue::text("2")],
                    vec![CellValue::Integer(3), CellValue::text("b@x.com"), CellValue::Null],
                ],
            );
        let options = EncodeOptions {
            ignore_types,
            ..EncodeOptions::default()
        };
        encode(&source, &path, &options).expect("encode");
        let file = EncodedFile::open(&path).expect("open");
        (dir, file)
    }

    fn value(value_type: ValueType, literal: &str) -> Query {
        Query::Value {
            value_type,
            literal: literal.to_string(),
        }
    }

    fn request(queries: Vec<Query>) -> SearchRequest {
        SearchRequest {
            queries,
            ..SearchRequest::default()
        }
    }

    #[test]
    fn value_search_finds_both_tables() {
        let (_dir, file) = shop(false);
        let reports = search(&file, &request(vec![value(ValueType::Text, "a@x.com")])).expect("search");
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, QueryOutcome::Searched));
        assert_eq!(
            reports[0].results,
            Results::Grouped(vec![
                GroupResult {
                    table: "users".to_string(),
                    column: "email".to_string(),
                    count: 1,
                    sample_rows: vec![1],
                },
                GroupResult {
                    table: "orders".to_string(),
                    column: "user_email".to_string(),
                    count: 2,
                    sample_rows: vec![1, 2],
                },
            ])
        );
    }

    #[test]
    fn max_results_caps_units() {
        let (_dir, file) = shop(false);
        let mut req = request(vec![value(ValueType::Text, "a@x.com")]);
        req.max_results = Some(2);
        req.show_all_results = true;
        let reports = search(&file, &req).expect("search");
        assert_eq!(reports[0].results.len(), 2);
        assert_eq!(reports[0].total, 3);
        assert!(reports[0].truncated);

        req.max_results = Some(10);
        let reports = search(&file, &req).expect("search");
        assert_eq!(reports[0].results.len(), 3);
        assert!(!reports[0].truncated);
    }

    #[test]
    fn max_results_with_many_values_is_rejected() {
        let (_dir, file) = shop(false);
        let mut req = request(vec![value(ValueType::Text, "a"), value(ValueType::Text, "b")]);
        req.max_results = Some(5);
        let err = search(&file, &req).expect_err("conflict");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn cell_search_excludes_itself_and_reports_not_found_per_query() {
        let (_dir, file) = shop(false);
        let mut req = request(vec![
            Query::Cell {
                table: "users".to_string(),
                row: 1,
                column: "email".to_string(),
            },
            Query::Cell {
                table: "users".to_string(),
                row: 9,
                column: "email".to_string(),
            },
        ]);
        req.show_all_results = true;
        let reports = search(&file, &req).expect("search");
        let Results::Cells(cells) = &reports[0].results else {
            panic!("expected cells");
        };
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|cell| cell.table == "orders"));
        assert!(reports[1].is_not_found());
        assert!(reports[1].results.is_empty());
    }

    #[test]
    fn column_search_skips_nulls_unless_included() {
        let (_dir, file) = shop(false);
        let column = Query::Column {
            table: "users".to_string(),
            column: "nick".to_string(),
        };
        let reports = search(&file, &request(vec![column.clone()])).expect("search");
        assert!(reports[0].results.is_empty());

        let mut req = request(vec![column]);
        req.include_null = true;
        let reports = search(&file, &req).expect("search");
        assert_eq!(
            reports[0].results,
            Results::Grouped(vec![GroupResult {
                table: "orders".to_string(),
                column: "note".to_string(),
                count: 2,
                sample_rows: vec![1, 3],
            }])
        );
    }

    #[test]
    fn column_search_aggregates_across_rows() {
        let (_dir, file) = shop(true);
        let reports = search(
            &file,
            &request(vec![Query::Column {
                table: "users".to_string(),
                column: "id".to_string(),
            }]),
        )
        .expect("search");
        let Results::Grouped(groups) = &reports[0].results else {
            panic!("expected groups");
        };
        let orders_id = groups
            .iter()
            .find(|group| group.table == "orders" && group.column == "id")
            .expect("orders.id group");
        assert_eq!(orders_id.count, 2);
        assert!(groups.iter().any(|group| group.column == "note" && group.count == 1));
    }

    #[test]
    fn zero_byte_blobs_are_not_treated_as_null_when_types_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flags.dat");
        let source = MemorySource::new()
            .with_table("a", &[("flag", "BLOB")], vec![vec![CellValue::Blob(vec![0])]])
            .with_table(
                "b",
                &[("flag", "BLOB"), ("n", "TEXT")],
                vec![vec![CellValue::Blob(vec![0]), CellValue::Null]],
            );
        let options = EncodeOptions {
            ignore_types: true,
            ..EncodeOptions::default()
        };
        encode(&source, &path, &options).expect("encode");
        let file = EncodedFile::open(&path).expect("open");
        let b_flag = Results::Grouped(vec![GroupResult {
            table: "b".to_string(),
            column: "flag".to_string(),
            count: 1,
            sample_rows: vec![1],
        }]);

        let reports = search(
            &file,
            &request(vec![
                Query::Cell {
                    table: "a".to_string(),
                    row: 1,
                    column: "flag".to_string(),
                },
                Query::Column {
                    table: "a".to_string(),
                    column: "flag".to_string(),
                },
            ]),
        )
        .expect("search");
        assert!(matches!(reports[0].outcome, QueryOutcome::Searched));
        assert_eq!(reports[0].results, b_flag);
        assert_eq!(reports[1].results, b_flag);

        let mut req = request(vec![value(ValueType::Null, "")]);
        req.include_null = true;
        let reports = search(&file, &req).expect("search");
        assert_eq!(reports[0].results.cell_count(), 1);
    }

    #[test]
    fn null_value_query_is_skipped_by_default() {
        let (_dir, file) = shop(false);
        let reports = search(&file, &request(vec![value(ValueType::Null, "")])).expect("search");
        assert!(matches!(reports[0].outcome, QueryOutcome::NullSkipped));

        let mut req = request(vec![value(ValueType::Null, "")]);
        req.include_null = true;
        let reports = search(&file, &req).expect("search");
        assert_eq!(reports[0].results.cell_count(), 3);
    }
}
