//! Purpose: `find-relations` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Stdout carries only JSON results; logs and diagnostics go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use find_relations::api::{
    EncodedFile, Error, ErrorKind, Query, QueryOutcome, QueryReport, Results, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Resource)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Configuration)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `find-relations --help`."));
            }
        },
    };

    init_tracing(cli.verbose);
    command_dispatch::dispatch_command(cli.command)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "find-relations",
    version,
    about = "Find undeclared relationships between database tables",
    long_about = None,
    before_help = r#"Encode a SQLite database into a file of hashed cells, then search it
for values, cells, or whole columns that appear elsewhere in the database."#,
    after_help = r#"EXAMPLES
  $ find-relations encode shop.db
  $ find-relations search shop.db.dat --value text a@x.com
  $ find-relations search shop.db.dat --cell users 1 email
  $ find-relations search shop.db.dat --column orders user_id --show-all-results

LEARN MORE
  $ find-relations <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, short = 'v', global = true, help = "Log progress to stderr (RUST_LOG overrides)")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Encode a database",
        long_about = r#"Encode a SQLite database FILE into a searchable file holding the hash of every cell.

The result is written to OUTPUT, or to FILE.dat. The destination is only replaced once
the new file is complete."#,
        after_help = r#"EXAMPLES
  $ find-relations encode shop.db
  $ find-relations encode shop.db shop.idx --hash sha256
  $ find-relations encode big.db --sample 1000 --seed 7 --ignore-types

NOTES
  - Algorithms: md5, sha1, sha224, sha256, sha384, sha512, sha3_224, sha3_256,
    sha3_384, sha3_512, blake2b, blake2s
  - --ignore-types makes INTEGER 5 and TEXT '5' equal
  - Ctrl-C stops at the next table boundary and leaves OUTPUT untouched"#
    )]
    Encode {
        #[arg(help = "SQLite database file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(help = "Output path (default: FILE.dat)", value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
        #[arg(long = "hash", value_name = "NAME", default_value = "md5", help = "Hash algorithm")]
        hash: String,
        #[arg(
            long,
            value_name = "ROWS",
            value_parser = clap::value_parser!(u64).range(1..),
            help = "Encode a random sample of ROWS rows per table"
        )]
        sample: Option<u64>,
        #[arg(long, value_name = "N", help = "Seed for reproducible sampling")]
        seed: Option<u64>,
        #[arg(long, help = "Do not encode type information")]
        ignore_types: bool,
        #[arg(
            long,
            value_name = "MIB",
            default_value_t = 64,
            value_parser = clap::value_parser!(u64).range(1..),
            help = "In-memory index budget before spilling to disk"
        )]
        memory_budget: u64,
        #[arg(long, value_name = "DIR", help = "Directory for spill segments", value_hint = ValueHint::DirPath)]
        spill_dir: Option<PathBuf>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Search an encoded database",
        long_about = r#"Search for values, cells, or columns inside an encoded FILE.

Rows and column numbers are 1-based. COLUMN may be a name or a number."#,
        after_help = r#"EXAMPLES
  $ find-relations search shop.db.dat --value integer 42
  $ find-relations search shop.db.dat --value text a@x.com --value blob 00ff
  $ find-relations search shop.db.dat --cell users 3 email --max-results 10
  $ find-relations search shop.db.dat --column users id --include-null

NOTES
  - Results are grouped by table/column unless --show-all-results is set
  - --max-results counts groups (or cells with --show-all-results)
  - --max-results requires a single query"#
    )]
    Search {
        #[arg(help = "Encoded file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(
            long = "value",
            num_args = 2,
            value_names = ["TYPE", "VALUE"],
            action = clap::ArgAction::Append,
            allow_hyphen_values = true,
            help = "Search for a value; TYPE is null|integer|real|text|blob (hex)"
        )]
        value: Vec<String>,
        #[arg(
            long = "cell",
            num_args = 3,
            value_names = ["TABLE", "ROW", "COLUMN"],
            action = clap::ArgAction::Append,
            help = "Search for the value in a cell"
        )]
        cell: Vec<String>,
        #[arg(
            long = "column",
            num_args = 2,
            value_names = ["TABLE", "COLUMN"],
            action = clap::ArgAction::Append,
            help = "Search for all values in a column"
        )]
        column: Vec<String>,
        #[arg(
            long,
            value_name = "N",
            value_parser = clap::value_parser!(u64).range(1..),
            help = "Stop after N results"
        )]
        max_results: Option<u64>,
        #[arg(long, help = "Do not skip null values")]
        include_null: bool,
        #[arg(long, help = "Do not aggregate results")]
        show_all_results: bool,
    },
    #[command(arg_required_else_help = true, about = "Describe an encoded file")]
    Info {
        #[arg(help = "Encoded file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, help = "Scan the whole index and check its invariants")]
        verify: bool,
    },
    #[command(about = "Print shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn query_json(query: &Query) -> Value {
    match query {
        Query::Value {
            value_type,
            literal,
        } => json!({ "mode": "value", "type": value_type.as_str(), "value": literal }),
        Query::Cell { table, row, column } => {
            json!({ "mode": "cell", "table": table, "row": row, "column": column })
        }
        Query::Column { table, column } => {
            json!({ "mode": "column", "table": table, "column": column })
        }
    }
}

fn report_json(report: &QueryReport) -> Value {
    let mut inner = Map::new();
    inner.insert("query".to_string(), query_json(&report.query));
    if let Some(digest) = &report.digest {
        inner.insert("digest".to_string(), json!(digest.to_hex()));
    }
    let status = match &report.outcome {
        QueryOutcome::Searched => "searched",
        QueryOutcome::NullSkipped => "null_skipped",
        QueryOutcome::NotFound(err) => {
            inner.insert("error".to_string(), error_body(err));
            "not_found"
        }
    };
    inner.insert("status".to_string(), json!(status));
    inner.insert("total".to_string(), json!(report.total));
    inner.insert("truncated".to_string(), json!(report.truncated));
    inner.insert("cells".to_string(), json!(report.results.cell_count()));
    let key = match report.results {
        Results::Grouped(_) => "groups",
        Results::Cells(_) => "matches",
    };
    inner.insert(
        key.to_string(),
        serde_json::to_value(&report.results).unwrap_or(Value::Null),
    );
    Value::Object(inner)
}

fn info_json(file: &EncodedFile, verified: Option<bool>) -> Value {
    let tables = file
        .tables()
        .iter()
        .map(|table| {
            let columns = table
                .columns
                .iter()
                .map(|column| json!({ "name": column.name, "declared_type": column.declared_type }))
                .collect::<Vec<_>>();
            json!({
                "name": table.name,
                "source_rows": table.source_rows,
                "encoded_rows": table.encoded_rows,
                "columns": columns,
            })
        })
        .collect::<Vec<_>>();
    let mut value = json!({
        "file": file.path().display().to_string(),
        "algorithm": file.algorithm().name(),
        "digest_len": file.algorithm().output_len(),
        "ignore_types": file.ignore_types(),
        "sample_size": file.sample_size(),
        "entries": file.entry_count(),
        "cells": file.cell_count(),
        "tables": tables,
    });
    if let (Some(verified), Some(obj)) = (verified, value.as_object_mut()) {
        obj.insert("verified".to_string(), json!(verified));
    }
    value
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let value = json!({ "error": error_body(err) });
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Configuration => "invalid configuration".to_string(),
        ErrorKind::SourceRead => "source database unreadable".to_string(),
        ErrorKind::Format => "corrupt or incompatible encoded file".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Resource => "i/o error".to_string(),
        ErrorKind::Interrupted => "interrupted".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_body(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().as_str()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    Value::Object(inner)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
