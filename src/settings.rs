use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dsl::codegen::CodegenOptions;
use crate::persist::{read_json, write_json, PersistError};

// ── Compiler settings ───────────────────────────────────────────────

/// Compiler and cache settings, stored as JSON next to the scripts or in a
/// config directory. Every field except `version` may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    pub version: u32,
    /// Name the generated chunk binds the runtime-support table to.
    pub runtime_namespace: String,
    /// Prefix of every mangled routine name.
    pub mangle_prefix: String,
    pub indent_width: usize,
    /// Name of the std thread used by `load_async` outside a tokio runtime.
    pub worker_thread_name: String,
    /// Append `-- file:line` comments to generated lines.
    pub emit_position_comments: bool,
}

const SETTINGS_VERSION: u32 = 1;

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            runtime_namespace: "rt".to_string(),
            mangle_prefix: "dm".to_string(),
            indent_width: 2,
            worker_thread_name: "script-compile".to_string(),
            emit_position_comments: false,
        }
    }
}

impl CompilerSettings {
    /// Code generator options for one compile.
    pub fn codegen_options(&self, script_id: u64) -> CodegenOptions {
        CodegenOptions {
            script_id,
            runtime_namespace: self.runtime_namespace.clone(),
            mangle_prefix: self.mangle_prefix.clone(),
            indent_width: self.indent_width,
            position_comments: self.emit_position_comments,
        }
    }
}

/// Load settings from `path`. Returns `Ok(None)` if the file does not exist.
pub fn load_settings(path: &Path) -> Result<Option<CompilerSettings>, PersistError> {
    if !path.exists() {
        return Ok(None);
    }
    let settings: CompilerSettings = read_json(path)?;
    if settings.version > SETTINGS_VERSION {
        return Err(PersistError::Version {
            found: settings.version,
            supported: SETTINGS_VERSION,
        });
    }
    Ok(Some(settings))
}

/// Save settings to `path` (atomic write), creating the parent directory.
pub fn save_settings(path: &Path, settings: &CompilerSettings) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_json(path, settings)
}
