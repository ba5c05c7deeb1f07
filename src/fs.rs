//! File system access, rooted at the execution root.
//!
//! Everything the build needs from the disk goes through the FileSystem trait
//! so tests can substitute an in-memory implementation.

use crate::hash::Digest;
use dashmap::DashMap;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Metadata gathered for one path.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileState {
    Missing,
    Directory,
    File(Digest),
}

impl FileState {
    pub fn digest(&self) -> Option<Digest> {
        match self {
            FileState::File(d) => Some(*d),
            _ => None,
        }
    }
}

pub trait FileSystem: Send + Sync {
    /// Absolute on-disk location of an execution-root-relative path.
    fn resolve(&self, path: &str) -> PathBuf;
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;
    /// stat() and digest a path.
    fn stat(&self, path: &str) -> io::Result<FileState>;
}

/// Identity of a file's on-disk contents as far as stat() can tell; a digest
/// is reused while this stays the same.
#[derive(Clone, Copy, PartialEq, Eq)]
struct StatKey {
    ino: u64,
    size: u64,
    mtime_ns: i128,
    ctime_ns: i128,
}

impl StatKey {
    fn of(meta: &std::fs::Metadata) -> Self {
        StatKey {
            ino: meta.ino(),
            size: meta.size(),
            mtime_ns: meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128,
            ctime_ns: meta.ctime() as i128 * 1_000_000_000 + meta.ctime_nsec() as i128,
        }
    }
}

pub struct RealFileSystem {
    root: PathBuf,
    /// Digests keyed by path, valid while the stat key matches.
    digests: DashMap<PathBuf, (StatKey, Digest)>,
}

impl RealFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RealFileSystem {
            root: root.into(),
            digests: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn digest_file(&self, path: PathBuf, meta: &std::fs::Metadata) -> io::Result<Digest> {
        let key = StatKey::of(meta);
        if let Some(entry) = self.digests.get(&path) {
            if entry.0 == key {
                return Ok(entry.1);
            }
        }
        let digest = Digest::of_reader(io::BufReader::new(std::fs::File::open(&path)?))?;
        self.digests.insert(path, (key, digest));
        Ok(digest)
    }
}

impl FileSystem for RealFileSystem {
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn stat(&self, path: &str) -> io::Result<FileState> {
        let full = self.resolve(path);
        let meta = match std::fs::metadata(&full) {
            Ok(meta) => meta,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    return Ok(FileState::Missing);
                }
                return Err(err);
            }
        };
        if meta.is_dir() {
            return Ok(FileState::Directory);
        }
        Ok(FileState::File(self.digest_file(full, &meta)?))
    }
}
