//! Seam to the embedded dynamic-language runtime that turns generated source
//! into bytecode, plus recognition of its error messages.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Opaque runtime bytecode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bytecode(Vec<u8>);

impl Bytecode {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Rejection from the runtime's own compiler. `message` may name a line of
/// the *generated* text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeCompileError {
    pub message: String,
}

impl RuntimeCompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

pub trait ScriptRuntime: Send + Sync {
    fn compile_to_bytecode(&self, chunk_name: &str, source: &str) -> Result<Bytecode, RuntimeCompileError>;
}

/// Runtime stand-in whose "bytecode" is the UTF-8 source itself. An optional
/// line limit models the fixed size limits of a real runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRuntime {
    max_lines: Option<usize>,
}

impl PassthroughRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_line_limit(max_lines: usize) -> Self {
        Self { max_lines: Some(max_lines) }
    }
}

impl ScriptRuntime for PassthroughRuntime {
    fn compile_to_bytecode(&self, chunk_name: &str, source: &str) -> Result<Bytecode, RuntimeCompileError> {
        if let Some(max) = self.max_lines {
            if source.lines().count() > max {
                return Err(RuntimeCompileError::new(format!(
                    "{chunk_name}:{}: control structure too long",
                    max + 1
                )));
            }
        }
        Ok(Bytecode::new(source.as_bytes().to_vec()))
    }
}

// ── Error recognition ───────────────────────────────────────────────

/// Fixed runtime limits a generated chunk can exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Locals,
    Upvalues,
    Constants,
    ControlStructure,
    Complexity,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitKind::Locals => "too many local variables",
            LimitKind::Upvalues => "too many upvalues",
            LimitKind::Constants => "too many constants",
            LimitKind::ControlStructure => "control structure too long",
            LimitKind::Complexity => "function or expression too complex",
        })
    }
}

/// What could be recovered from a runtime compile error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDiagnostic {
    /// Line of the generated text the message names.
    pub line: Option<u32>,
    pub limit: Option<LimitKind>,
}

#[allow(clippy::expect_used)] // constant patterns
static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^:(\d+):").expect("line regex should compile"));

#[allow(clippy::expect_used)] // constant patterns
static LIMIT_RES: LazyLock<Vec<(Regex, LimitKind)>> = LazyLock::new(|| {
    [
        (r"too many local variables|more than \d+ local variables", LimitKind::Locals),
        (r"too many upvalues|more than \d+ upvalues", LimitKind::Upvalues),
        (r"constant table overflow|too many constants", LimitKind::Constants),
        (r"control structure too long", LimitKind::ControlStructure),
        (r"function or expression (too complex|needs too many registers)", LimitKind::Complexity),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("limit regex should compile"), kind))
    .collect()
});

/// Pull the generated line number and any known limit shape out of `message`.
///
/// The line is only read right after `chunk_name`, so a chunk name that itself
/// contains `:<digits>:` is not mistaken for the position.
pub fn classify(chunk_name: &str, message: &str) -> RuntimeDiagnostic {
    let line = message
        .strip_prefix(chunk_name)
        .and_then(|rest| LINE_RE.captures(rest))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let limit = LIMIT_RES
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, kind)| *kind);
    RuntimeDiagnostic { line, limit }
}
