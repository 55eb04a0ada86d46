//! Generated line → original source position.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ast::{file_name, SourcePos};

/// A resolved position: file name plus line and column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Append-only while the generator runs; lines are 1-based and tagged in
/// increasing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMap {
    files: Vec<String>,
    entries: Vec<(u32, SourcePos)>,
}

impl SourceMap {
    pub fn new(files: Vec<String>) -> Self {
        Self {
            files,
            entries: Vec::new(),
        }
    }

    /// Record that generated `line` came from `pos`. The first tag on a line
    /// wins; tags for lines before the last tagged one are ignored.
    pub fn tag(&mut self, line: u32, pos: SourcePos) {
        match self.entries.last() {
            Some(&(last, _)) if last >= line => {}
            _ => self.entries.push((line, pos)),
        }
    }

    /// The position tagged exactly on `line`.
    pub fn tagged(&self, line: u32) -> Option<SourcePos> {
        self.entries
            .binary_search_by_key(&line, |(l, _)| *l)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|(_, pos)| *pos)
    }

    /// The position for `line`, falling back to the nearest preceding tagged
    /// line. `None` when nothing at or before `line` is tagged.
    pub fn source_pos_of(&self, line: u32) -> Option<SourcePos> {
        let after = self.entries.partition_point(|(l, _)| *l <= line);
        after
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .map(|(_, pos)| *pos)
    }

    pub fn location_of(&self, line: u32) -> Option<Location> {
        let pos = self.source_pos_of(line)?;
        Some(Location {
            file: file_name(&self.files, pos.file).unwrap_or("<unknown>").to_string(),
            line: pos.line,
            column: pos.column,
        })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
