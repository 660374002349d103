//! Purpose: Map typed cell values to the byte form that gets hashed.
//! Exports: `canonicalize`, `canonicalize_into`, `ValueType`, `parse_literal`.
//! Role: Single definition of value equality for both encode and search.
//! Invariants: Output depends only on the value and the ignore-types flag.
//! Invariants: NULL is always the single byte `TAG_NULL`; no other value starts with it.
//! Invariants: Numbers render as decimal text, never as native binary width.
use std::fmt::Write as _;
use std::str::FromStr;

use crate::core::error::{Error, ErrorKind};
use crate::core::source::CellValue;

pub const TAG_NULL: u8 = 0x00;
pub const TAG_INTEGER: u8 = 0x01;
pub const TAG_REAL: u8 = 0x02;
pub const TAG_TEXT: u8 = 0x03;
pub const TAG_BLOB: u8 = 0x04;
/// Marks every non-null value when types are ignored, keeping NULL's form unique.
pub const TAG_UNTYPED: u8 = 0x01;

pub fn canonicalize(value: &CellValue, ignore_types: bool) -> Vec<u8> {
    let mut out = Vec::new();
    canonicalize_into(value, ignore_types, &mut out);
    out
}

/// Clears `out` and writes the canonical bytes of `value` into it.
pub fn canonicalize_into(value: &CellValue, ignore_types: bool, out: &mut Vec<u8>) {
    out.clear();
    if value.is_null() {
        out.push(TAG_NULL);
        return;
    }
    out.push(if ignore_types { TAG_UNTYPED } else { tag(value) });
    match value {
        CellValue::Null => {}
        CellValue::Integer(v) => out.extend_from_slice(v.to_string().as_bytes()),
        CellValue::Real(v) => out.extend_from_slice(real_text(*v).as_bytes()),
        CellValue::Text(bytes) | CellValue::Blob(bytes) => out.extend_from_slice(bytes),
    }
}

fn tag(value: &CellValue) -> u8 {
    match value {
        CellValue::Null => TAG_NULL,
        CellValue::Integer(_) => TAG_INTEGER,
        CellValue::Real(_) => TAG_REAL,
        CellValue::Text(_) => TAG_TEXT,
        CellValue::Blob(_) => TAG_BLOB,
    }
}

fn real_text(value: f64) -> String {
    // -0.0 and 0.0 compare equal and must hash equal.
    let value = if value == 0.0 { 0.0 } else { value };
    let mut text = String::new();
    let _ = write!(text, "{value}");
    text
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Integer => "integer",
            ValueType::Real => "real",
            ValueType::Text => "text",
            ValueType::Blob => "blob",
        }
    }
}

impl FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" => Ok(ValueType::Null),
            "integer" | "int" => Ok(ValueType::Integer),
            "real" | "float" => Ok(ValueType::Real),
            "text" => Ok(ValueType::Text),
            "blob" => Ok(ValueType::Blob),
            _ => Err(Error::new(ErrorKind::Configuration)
                .with_message(format!("unknown value type '{s}'"))
                .with_hint("Use one of: null, integer, real, text, blob.")),
        }
    }
}

/// Parses a query literal; blobs are given as hex.
pub fn parse_literal(value_type: ValueType, literal: &str) -> Result<CellValue, Error> {
    let invalid = |what: &str| {
        Error::new(ErrorKind::Configuration)
            .with_message(format!("invalid {what} literal '{literal}'"))
    };
    match value_type {
        ValueType::Null => Ok(CellValue::Null),
        ValueType::Integer => literal
            .trim()
            .parse::<i64>()
            .map(CellValue::Integer)
            .map_err(|err| invalid("integer").with_source(err)),
        ValueType::Real => literal
            .trim()
            .parse::<f64>()
            .map(CellValue::Real)
            .map_err(|err| invalid("real").with_source(err)),
        ValueType::Text => Ok(CellValue::text(literal)),
        ValueType::Blob => decode_hex(literal)
            .map(CellValue::Blob)
            .ok_or_else(|| invalid("blob").with_hint("Blob literals are hex, e.g. 00ff10.")),
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
