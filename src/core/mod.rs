// Core modules: canonical form, hashing, sampling, index build/read, and search.
pub mod builder;
pub mod canonical;
pub mod digest;
pub mod error;
pub mod format;
pub mod query;
pub mod reader;
pub mod sample;
pub mod source;
pub mod spill;
pub mod sqlite;
