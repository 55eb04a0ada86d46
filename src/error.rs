use std::io;
use std::path::{Path, PathBuf};

use crate::dsl::error::{CompileError, ErrorKind};
use crate::dsl::source_map::Location;
use crate::parser::ParseError;
use crate::runtime::LimitKind;

/// Why a script could not be loaded. One value per failed load, shared
/// (cloned) with every caller waiting on the same signature.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("{}: {message}", path.display())]
    Io {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
    },
    #[error("{}: parse error: {source}", path.display())]
    Parse { path: PathBuf, source: ParseError },
    #[error("{}: {} semantic error(s)", path.display(), diagnostics.len())]
    Semantic {
        path: PathBuf,
        /// File table of the script, for rendering diagnostic positions.
        files: Vec<String>,
        diagnostics: Vec<CompileError>,
    },
    /// Generator invariant violation: a compiler defect, not a user error.
    #[error("{}: internal compiler error at {}: {}", path.display(), error.pos, error.message)]
    Codegen { path: PathBuf, error: CompileError },
    #[error(
        "{}{}: runtime rejected generated code: {message}",
        path.display(),
        location.as_ref().map(|l| format!(" ({l})")).unwrap_or_default()
    )]
    Runtime {
        path: PathBuf,
        message: String,
        /// Original source position recovered through the source map.
        location: Option<Location>,
        limit: Option<LimitKind>,
    },
    #[error("{}: compile job ended without a result", path.display())]
    Abandoned { path: PathBuf },
}

impl LoadError {
    pub fn io(path: &Path, err: &io::Error) -> Self {
        LoadError::Io {
            path: path.to_path_buf(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Split pass errors into a semantic report or a generator defect.
    pub fn from_compile_errors(path: &Path, files: &[String], errors: Vec<CompileError>) -> Self {
        match errors.iter().find(|e| e.kind == ErrorKind::Codegen) {
            Some(defect) => LoadError::Codegen {
                path: path.to_path_buf(),
                error: defect.clone(),
            },
            None => LoadError::Semantic {
                path: path.to_path_buf(),
                files: files.to_vec(),
                diagnostics: errors,
            },
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            LoadError::Io { path, .. }
            | LoadError::Parse { path, .. }
            | LoadError::Semantic { path, .. }
            | LoadError::Codegen { path, .. }
            | LoadError::Runtime { path, .. }
            | LoadError::Abandoned { path } => path,
        }
    }

    /// Multi-line report: the summary plus one line per diagnostic.
    pub fn render(&self) -> String {
        match self {
            LoadError::Semantic { files, diagnostics, .. } => {
                let mut out = self.to_string();
                for d in diagnostics {
                    out.push_str("\n  ");
                    out.push_str(&d.format_with_files(files));
                }
                out
            }
            LoadError::Runtime { limit: Some(limit), .. } => format!("{self}\n  limit exceeded: {limit}"),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::ast::SourcePos;

    #[test]
    fn semantic_report_lists_every_diagnostic() {
        let err = LoadError::from_compile_errors(
            Path::new("/s/a.dnh"),
            &["/s/a.dnh".to_string()],
            vec![
                CompileError::semantic("'break' outside of a loop", SourcePos::new(3, 5)),
                CompileError::semantic("cannot assign to constant 'x'", SourcePos::new(8, 1)),
            ],
        );
        let text = err.render();
        assert!(text.starts_with("/s/a.dnh: 2 semantic error(s)"), "{text}");
        assert!(text.contains("[semantic] /s/a.dnh:3:5: 'break' outside of a loop"), "{text}");
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn codegen_errors_win_over_semantic_ones() {
        let err = LoadError::from_compile_errors(
            Path::new("/a"),
            &[],
            vec![CompileError::codegen("reference to eliminated routine 'F'", SourcePos::new(2, 1))],
        );
        assert!(matches!(err, LoadError::Codegen { .. }));
        assert_eq!(err.path(), Path::new("/a"));
    }

    #[test]
    fn runtime_error_shows_the_recovered_location() {
        let err = LoadError::Runtime {
            path: "/s/a.dnh".into(),
            message: "@/s/a.dnh:14: too many local variables".into(),
            location: Some(Location { file: "/s/a.dnh".into(), line: 6, column: 3 }),
            limit: Some(LimitKind::Locals),
        };
        assert!(err.to_string().starts_with("/s/a.dnh (/s/a.dnh:6:3): runtime rejected"), "{err}");
        assert!(err.render().ends_with("limit exceeded: too many local variables"));
    }
}
