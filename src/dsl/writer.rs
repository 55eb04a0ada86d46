//! Line-oriented text sink for the code generator.

use super::ast::SourcePos;
use super::source_map::SourceMap;

/// Accumulates generated source, tracks indentation with an explicit depth
/// counter and records the source map as lines are tagged.
pub struct CodeWriter {
    out: String,
    indent_unit: String,
    depth: usize,
    /// 1-based number of the line currently being written.
    line: u32,
    /// Byte offset in `out` where the current line starts.
    line_start: usize,
    /// Whether the current line holds anything besides indentation.
    line_has_text: bool,
    map: SourceMap,
}

impl CodeWriter {
    pub fn new(indent_width: usize, files: Vec<String>) -> Self {
        Self {
            out: String::new(),
            indent_unit: " ".repeat(indent_width),
            depth: 0,
            line: 1,
            line_start: 0,
            line_has_text: false,
            map: SourceMap::new(files),
        }
    }

    /// Move to a fresh physical line at the current depth.
    ///
    /// Idempotent: while the current line is still empty this only
    /// re-applies the indentation for the current depth.
    pub fn start_line(&mut self) {
        if self.line_has_text {
            self.out.push('\n');
            self.line += 1;
            self.line_start = self.out.len();
            self.line_has_text = false;
        }
        self.out.truncate(self.line_start);
        for _ in 0..self.depth {
            self.out.push_str(&self.indent_unit);
        }
    }

    pub fn write(&mut self, text: &str) {
        if !self.line_has_text && self.out.len() == self.line_start {
            self.start_line();
        }
        if !text.is_empty() {
            self.out.push_str(text);
            self.line_has_text = true;
        }
    }

    /// Write `text` as a complete line of its own.
    pub fn line(&mut self, text: &str) {
        self.start_line();
        self.write(text);
    }

    /// Write `text` on a new line tagged with `pos`.
    pub fn tagged_line(&mut self, text: &str, pos: SourcePos) {
        self.start_line();
        self.tag(pos);
        self.write(text);
    }

    /// Attribute the current line to `pos`.
    pub fn tag(&mut self, pos: SourcePos) {
        self.map.tag(self.line, pos);
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn dedent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Finish the text (dropping a trailing empty line) and hand back the map.
    pub fn finish(mut self) -> (String, SourceMap) {
        if !self.line_has_text {
            self.out.truncate(self.line_start);
        }
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
        (self.out, self.map)
    }
}
