//! Post-processing: decoding of table-shaped LLM responses.
//!
//! The generative service is asked for a JSON array and mostly complies. The
//! rules here fix the quirks that remain without touching cell content:
//!
//! - Wrapping output in ` ```json ... ``` ` fences despite a JSON response type
//! - Returning `{"rows": [...]}` or a bare object instead of an array
//! - Echoing the column labels back as a first record
//! - Numbers instead of strings (`"sankhya": 161`)
//! - Line breaks and tabs inside a cell, which would break the TSV layout
//! - Zero-width characters inside cells
//!
//! Document-shaped responses are returned as-is (trimmed) by the formatter and
//! never pass through here.

use crate::error::ScanError;
use crate::numerals::normalize_digits;
use crate::request::{Column, ColumnSpec};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

type Record = Map<String, Value>;

/// Decode a JSON table response into tab-separated rows in column order.
///
/// Rules (applied in order):
/// 1. Strip an outer code fence
/// 2. Parse JSON; accept an array, a single object, or an object wrapping an array
/// 3. Drop records that only repeat the header labels, and records with no values
/// 4. Render every cell as flat text (no tabs or line breaks)
/// 5. Normalise numerals in serial-number columns
/// 6. Join cells with `\t`; missing keys become `""`
///
/// A response that is not JSON, or JSON of the wrong structure, yields
/// [`ScanError::MalformedResponse`] carrying the raw text.
pub fn decode_table(raw: &str, columns: &ColumnSpec) -> Result<Vec<String>, ScanError> {
    let malformed = |detail: String| ScanError::MalformedResponse {
        service: "gemini",
        detail,
        raw: raw.to_string(),
    };

    let body = strip_code_fences(raw);
    let value: Value = serde_json::from_str(&body)
        .map_err(|e| malformed(format!("table response is not valid JSON: {e}")))?;
    let records = extract_records(value).map_err(malformed)?;

    let total = records.len();
    let rows: Vec<String> = records
        .iter()
        .filter(|r| !is_header_echo(r, columns))
        .filter_map(|r| project_record(r, columns))
        .collect();

    debug!("Decoded {} table rows ({} records received)", rows.len(), total);
    Ok(rows)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap()
});

fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

// ── Rule 2: Locate the record list ───────────────────────────────────────────

fn extract_records(value: Value) -> Result<Vec<Record>, String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::Object(map) => Ok(map),
                other => Err(format!("expected an array of objects, found {}", kind(&other))),
            })
            .collect(),
        Value::Object(map) => {
            let wrapped = map.values().find_map(|v| match v {
                Value::Array(items) if items.iter().all(Value::is_object) => Some(items.clone()),
                _ => None,
            });
            match wrapped {
                Some(items) => extract_records(Value::Array(items)),
                None => Ok(vec![map]),
            }
        }
        other => Err(format!("expected a JSON array, found {}", kind(&other))),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Rule 3: Header echoes ────────────────────────────────────────────────────

fn is_header_echo(record: &Record, columns: &ColumnSpec) -> bool {
    let mut any = false;
    for col in columns.columns() {
        let cell = lookup(record, col).map(cell_text).unwrap_or_default();
        if cell.is_empty() {
            continue;
        }
        any = true;
        let lower = cell.to_lowercase();
        if lower != col.label.to_lowercase() && lower != col.key {
            return false;
        }
    }
    any
}

// ── Rules 4–6: Projection ────────────────────────────────────────────────────

fn lookup<'a>(record: &'a Record, col: &Column) -> Option<&'a Value> {
    record
        .get(&col.key)
        .or_else(|| record.get(&col.label))
        .or_else(|| {
            record
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&col.key) || k.trim() == col.label)
                .map(|(_, v)| v)
        })
}

fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(cell_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    };
    flatten(&remove_invisible_chars(&text))
}

/// Collapse every whitespace run (tabs and line breaks included) to one space.
fn flatten(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn project_record(record: &Record, columns: &ColumnSpec) -> Option<String> {
    let serial = columns.serial_index();
    let cells: Vec<String> = columns
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let cell = lookup(record, col).map(cell_text).unwrap_or_default();
            if serial == Some(i) {
                normalize_digits(&cell)
            } else {
                cell
            }
        })
        .collect();

    if cells.iter().all(String::is_empty) {
        return None;
    }
    Some(cells.join("\t"))
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{2060}'],
        "",
    )
}
