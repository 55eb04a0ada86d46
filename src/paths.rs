//! Centralized path definitions for settings and compiled artifacts.
//!
//! No other module should hard-code these strings.

use std::path::{Path, PathBuf};

// ── Leaf filenames ───────────────────────────────────────────────

pub const SETTINGS_FILE: &str = "danmakuc.json";

/// Extension of an on-disk compiled artifact.
pub const ARTIFACT_EXT: &str = "dmc.json";

/// Chunk name prefix the runtime sees in its own error messages.
pub const CHUNK_PREFIX: &str = "@";

// ── Functions ────────────────────────────────────────────────────

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

/// `out_dir/<stem>.dmc.json` for a script at `script`.
pub fn artifact_path(out_dir: &Path, script: &Path) -> PathBuf {
    let stem = script
        .file_stem()
        .map_or_else(|| "script".to_string(), |s| s.to_string_lossy().into_owned());
    out_dir.join(format!("{stem}.{ARTIFACT_EXT}"))
}

/// Chunk name handed to the runtime for a script.
pub fn chunk_name(script: &Path) -> String {
    format!("{CHUNK_PREFIX}{}", script.display())
}
