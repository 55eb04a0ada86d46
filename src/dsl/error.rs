use serde::{Deserialize, Serialize};

use super::ast::{file_name, SourcePos};

/// A compilation error with source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileError {
    pub message: String,
    pub pos: SourcePos,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Static semantic violation in user code.
    Semantic,
    /// Generator invariant violation. A compiler defect, never a user error.
    Codegen,
}

impl CompileError {
    pub fn semantic(message: impl Into<String>, pos: SourcePos) -> Self {
        Self {
            message: message.into(),
            pos,
            kind: ErrorKind::Semantic,
        }
    }

    pub fn codegen(message: impl Into<String>, pos: SourcePos) -> Self {
        Self {
            message: message.into(),
            pos,
            kind: ErrorKind::Codegen,
        }
    }

    /// Format the error with the file name its position points into.
    pub fn format_with_files(&self, files: &[String]) -> String {
        let file = file_name(files, self.pos.file).unwrap_or("<unknown>");
        format!(
            "[{}] {}:{}:{}: {}",
            match self.kind {
                ErrorKind::Semantic => "semantic",
                ErrorKind::Codegen => "codegen",
            },
            file,
            self.pos.line,
            self.pos.column,
            self.message,
        )
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::ast::FileId;

    #[test]
    fn formats_with_included_file_name() {
        let err = CompileError::semantic("'break' outside of a loop", SourcePos::in_file(FileId(1), 12, 5));
        let files = vec!["main.dnh".to_string(), "lib/shots.dnh".to_string()];
        assert_eq!(
            err.format_with_files(&files),
            "[semantic] lib/shots.dnh:12:5: 'break' outside of a loop"
        );
    }

    #[test]
    fn unknown_file_is_marked() {
        let err = CompileError::codegen("bad", SourcePos::in_file(FileId(7), 1, 1));
        assert!(err.format_with_files(&[]).starts_with("[codegen] <unknown>:1:1"));
    }
}
