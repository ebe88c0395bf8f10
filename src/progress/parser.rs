//! Line-oriented parser for progress files.

use std::path::Path;

use tracing::warn;

use crate::models::progress::ProgressRecord;
use crate::security;

/// Extension of progress files.
pub const PROGRESS_EXTENSION: &str = "jsonl";

/// Result of parsing a chunk of progress bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedChunk {
    /// Records in file order.
    pub records: Vec<ProgressRecord>,
    /// Number of non-empty lines that could not be parsed.
    pub malformed: usize,
}

/// Parse newline-separated JSON records.
///
/// Blank lines are ignored; malformed lines (including invalid UTF-8) are
/// skipped with a warning and counted.
#[must_use]
pub fn parse_chunk(bytes: &[u8]) -> ParsedChunk {
    let mut parsed = ParsedChunk::default();
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<ProgressRecord>(line) {
            Ok(record) => parsed.records.push(record),
            Err(err) => {
                parsed.malformed += 1;
                warn!(line = index + 1, %err, "skipping malformed progress line");
            }
        }
    }
    parsed
}

/// Task id encoded in a progress file name, if `path` is one.
#[must_use]
pub fn task_id_from_path(path: &Path) -> Option<String> {
    if path.extension()? != PROGRESS_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    security::validate_task_id(stem).ok()?;
    Some(stem.to_owned())
}
