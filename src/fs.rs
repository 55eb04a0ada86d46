//! File-system collaborator used to identify and read scripts.
//!
//! The cache only ever touches files through [`FileSystem`], so hosts can serve
//! scripts from archives and tests can change modification times at will.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use parking_lot::RwLock;

pub trait FileSystem: Send + Sync {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;
    fn last_modified(&self, path: &Path) -> io::Result<SystemTime>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// The real file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn last_modified(&self, path: &Path) -> io::Result<SystemTime> {
        std::fs::metadata(path)?.modified()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: SystemTime,
}

/// In-memory file system keyed by normalized absolute-style paths.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<HashMap<PathBuf, MemoryFile>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file, stamped with the current time.
    pub fn insert(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        self.insert_at(path, data, SystemTime::now());
    }

    pub fn insert_at(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>, modified: SystemTime) {
        self.files.write().insert(
            normalize(path.as_ref()),
            MemoryFile {
                data: data.into(),
                modified,
            },
        );
    }

    /// Change a file's modification time. Returns false if it does not exist.
    pub fn touch(&self, path: impl AsRef<Path>, modified: SystemTime) -> bool {
        match self.files.write().get_mut(&normalize(path.as_ref())) {
            Some(file) => {
                file.modified = modified;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files.write().remove(&normalize(path.as_ref())).is_some()
    }

    fn with_file<T>(&self, path: &Path, f: impl FnOnce(&MemoryFile) -> T) -> io::Result<T> {
        let files = self.files.read();
        files.get(&normalize(path)).map(f).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{}: no such file", path.display()))
        })
    }
}

impl FileSystem for MemoryFileSystem {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        let normalized = normalize(path);
        self.with_file(&normalized, |_| normalized.clone())
    }

    fn last_modified(&self, path: &Path) -> io::Result<SystemTime> {
        self.with_file(path, |f| f.modified)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.with_file(path, |f| f.data.clone())
    }
}

/// Lexically resolve `.` and `..` and make the path rooted.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn canonical_paths_are_normalized() {
        let fs = MemoryFileSystem::new();
        fs.insert("/scripts/boss.dnh", "x");
        let canonical = fs.canonicalize(Path::new("scripts/./stages/../boss.dnh")).unwrap();
        assert_eq!(canonical, PathBuf::from("/scripts/boss.dnh"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let fs = MemoryFileSystem::new();
        let err = fs.canonicalize(Path::new("/nope.dnh")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(fs.read(Path::new("/nope.dnh")).is_err());
    }

    #[test]
    fn touch_changes_the_timestamp() {
        let fs = MemoryFileSystem::new();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        fs.insert_at("/a.dnh", "x", t0);
        assert_eq!(fs.last_modified(Path::new("/a.dnh")).unwrap(), t0);
        assert!(fs.touch("/a.dnh", t0 + Duration::from_secs(1)));
        assert_eq!(fs.last_modified(Path::new("/a.dnh")).unwrap(), t0 + Duration::from_secs(1));
        assert!(!fs.touch("/b.dnh", t0));
    }

    #[test]
    fn os_file_system_reads_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, b"{}").unwrap();
        let fs = OsFileSystem;
        let canonical = fs.canonicalize(&path).unwrap();
        assert_eq!(fs.read(&canonical).unwrap(), b"{}");
        assert!(fs.last_modified(&canonical).is_ok());
    }
}
