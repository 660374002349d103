//! Purpose: Hold top-level CLI command dispatch for `find-relations`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Exit code is non-zero only for failures or per-query `NotFound` outcomes.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use find_relations::api::{
    EncodeOptions, HashAlgorithm, SearchRequest, SqliteSource, ValueType, default_output_path,
    encode, search,
};

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "find-relations", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Encode {
            file,
            output,
            hash,
            sample,
            seed,
            ignore_types,
            memory_budget,
            spill_dir,
        } => {
            let algorithm = HashAlgorithm::from_name(&hash)?;
            let memory_budget = usize::try_from(memory_budget.saturating_mul(1024 * 1024))
                .unwrap_or(usize::MAX);
            let output = output.unwrap_or_else(|| default_output_path(&file));
            let options = EncodeOptions {
                algorithm,
                ignore_types,
                sample_size: sample,
                seed,
                memory_budget,
                spill_dir,
                cancel: Some(install_cancel_flag()),
            };
            options.validate()?;

            let started = Instant::now();
            let source = SqliteSource::open(&file)?;
            let summary = encode(&source, &output, &options)?;
            emit_json(json!({
                "encoded": {
                    "source": file.display().to_string(),
                    "output": summary.output.display().to_string(),
                    "algorithm": algorithm.name(),
                    "ignore_types": ignore_types,
                    "sample_size": sample,
                    "tables": summary.tables,
                    "cells": summary.cells,
                    "entries": summary.entries,
                    "spilled_segments": summary.spilled_segments,
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                }
            }));
            Ok(RunOutcome::ok())
        }
        Command::Search {
            file,
            value,
            cell,
            column,
            max_results,
            include_null,
            show_all_results,
        } => {
            let request = SearchRequest {
                queries: parse_queries(&value, &cell, &column)?,
                max_results: max_results.map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
                include_null,
                show_all_results,
            };
            request.validate()?;

            let encoded = EncodedFile::open(&file)?;
            let reports = search(&encoded, &request)?;
            let not_found = reports.iter().filter(|report| report.is_not_found()).count();
            emit_json(json!({
                "file": encoded.path().display().to_string(),
                "algorithm": encoded.algorithm().name(),
                "ignore_types": encoded.ignore_types(),
                "sample_size": encoded.sample_size(),
                "results": reports.iter().map(report_json).collect::<Vec<_>>(),
            }));
            if not_found > 0 {
                tracing::info!(not_found, "some queries did not resolve");
                return Ok(RunOutcome::with_code(to_exit_code(ErrorKind::NotFound)));
            }
            Ok(RunOutcome::ok())
        }
        Command::Info { file, verify } => {
            let encoded = EncodedFile::open(&file)?;
            let verified = if verify {
                encoded.verify()?;
                Some(true)
            } else {
                None
            };
            emit_json(info_json(&encoded, verified));
            Ok(RunOutcome::ok())
        }
    }
}

// SIGINT/SIGTERM set the flag; the encoder stops at the next table boundary.
fn install_cancel_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&flag)) {
            tracing::warn!(signal, error = %err, "failed to install signal handler");
        }
    }
    flag
}

fn parse_queries(value: &[String], cell: &[String], column: &[String]) -> Result<Vec<Query>, Error> {
    let mut queries = Vec::new();
    for pair in value.chunks(2) {
        let [value_type, literal] = pair else {
            return Err(usage_error("--value takes TYPE and VALUE"));
        };
        queries.push(Query::Value {
            value_type: value_type.parse::<ValueType>()?,
            literal: literal.clone(),
        });
    }
    for triple in cell.chunks(3) {
        let [table, row, column] = triple else {
            return Err(usage_error("--cell takes TABLE, ROW and COLUMN"));
        };
        let row = row.parse::<u64>().map_err(|err| {
            usage_error(format!("invalid row '{row}'"))
                .with_hint("Rows are 1-based integers.")
                .with_source(err)
        })?;
        queries.push(Query::Cell {
            table: table.clone(),
            row,
            column: column.clone(),
        });
    }
    for pair in column.chunks(2) {
        let [table, column] = pair else {
            return Err(usage_error("--column takes TABLE and COLUMN"));
        };
        queries.push(Query::Column {
            table: table.clone(),
            column: column.clone(),
        });
    }
    Ok(queries)
}

fn usage_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Configuration).with_message(message)
}
