//! Purpose: Library crate backing the `find-relations` CLI and tests.
//! Exports: `api` (stable surface), `core` (encoder, reader, search engine, errors).
//! Role: Hash every cell of a database into a sorted index, then search it by value,
//!       cell, or column without touching the source again.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
