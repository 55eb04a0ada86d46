//! Front-end seam. The grammar lives outside this crate; a front end hands
//! over the AST either by implementing [`ScriptParser`] or by serializing the
//! tree to the JSON interchange format read by [`JsonAstParser`].

use std::path::Path;

use crate::dsl::ast::Script;
use crate::fs::FileSystem;

/// Opaque front-end failure, surfaced verbatim with the script path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }
}

pub trait ScriptParser: Send + Sync {
    fn parse(&self, path: &Path, fs: &dyn FileSystem) -> Result<Script, ParseError>;
}

/// Reads a JSON-serialized [`Script`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAstParser;

impl JsonAstParser {
    pub fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<Script, ParseError> {
        let mut script: Script = serde_json::from_slice(bytes).map_err(|e| ParseError {
            message: e.to_string(),
            line: u32::try_from(e.line()).ok(),
            column: u32::try_from(e.column()).ok(),
        })?;
        if script.files.is_empty() {
            script.files.push(path.display().to_string());
        }
        script.mark_root_entries();
        Ok(script)
    }
}

impl ScriptParser for JsonAstParser {
    fn parse(&self, path: &Path, fs: &dyn FileSystem) -> Result<Script, ParseError> {
        let bytes = fs
            .read(path)
            .map_err(|e| ParseError::new(format!("cannot read {}: {e}", path.display())))?;
        self.parse_bytes(path, &bytes)
    }
}
