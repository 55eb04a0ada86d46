//! Crash-safe JSON files for settings and compiled artifacts.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported format version {found} (newest supported is {supported})")]
    Version { found: u32, supported: u32 },
}

// ── Writes ──────────────────────────────────────────────────────────

/// One lock per target path; two writers of the same file would share a
/// staging file.
static WRITE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn write_lock(path: &Path) -> Arc<Mutex<()>> {
    Arc::clone(WRITE_LOCKS.lock().entry(path.to_path_buf()).or_default())
}

/// Drop the entry for `path` unless another writer is holding or waiting on it.
/// `lock` must be the caller's only reference.
fn release_write_lock(path: &Path, lock: &Arc<Mutex<()>>) {
    let mut locks = WRITE_LOCKS.lock();
    // One reference in the map, one here.
    if Arc::strong_count(lock) == 2 {
        locks.remove(path);
    }
}

/// `dir/name` → `dir/name{suffix}`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `path` with `data`. Readers see the old file or the new one, never
/// a partial write. The previous contents are kept as `<name>.bak`.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let lock = write_lock(path);
    let result = {
        let _guard = lock.lock();
        let staged = sibling(path, ".tmp");
        let result = replace_with_staged(path, &staged, data);
        if result.is_err() {
            let _ = fs::remove_file(&staged);
        }
        result
    };
    release_write_lock(path, &lock);
    result.map_err(PersistError::from)
}

fn replace_with_staged(path: &Path, staged: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(staged)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    if path.exists() {
        // A failed backup never blocks the write.
        let _ = fs::copy(path, sibling(path, ".bak"));
    }
    fs::rename(staged, path)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    atomic_write(path, &serde_json::to_vec_pretty(value)?)
}

// ── Reads ───────────────────────────────────────────────────────────

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
