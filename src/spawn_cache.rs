//! A content-addressed spawn cache on local disk.
//!
//! Entries live under `<dir>/<spawn digest>/`: one file per declared output
//! (named by its position) plus the captured stdout/stderr.  Entries are
//! populated in a scratch directory and renamed into place, so a reader never
//! sees a partial entry.

use crate::spawn::{CacheHandle, ExecError, Spawn, SpawnCache, SpawnContext, SpawnResult, Status};
use std::io;
use std::path::{Path, PathBuf};

const NAME: &str = "disk-cache";

pub struct DiskSpawnCache {
    dir: PathBuf,
}

impl DiskSpawnCache {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(DiskSpawnCache { dir })
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Copies a cached entry's outputs into the execution root.
    fn restore(&self, entry: &Path, spawn: &Spawn, exec_root: &Path) -> io::Result<SpawnResult> {
        for (i, out) in spawn.outputs.iter().enumerate() {
            let dest = exec_root.join(out);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Replace rather than overwrite in place, in case the old output is
            // a hard link into somewhere else.
            let _ = std::fs::remove_file(&dest);
            std::fs::copy(entry.join(i.to_string()), &dest)?;
        }
        let mut result = SpawnResult::new(NAME, Status::Success, 0);
        result.stdout = std::fs::read(entry.join("stdout"))?;
        result.stderr = std::fs::read(entry.join("stderr"))?;
        Ok(result)
    }
}

struct DiskHandle<'a> {
    cache: &'a DiskSpawnCache,
    key: String,
    exec_root: PathBuf,
    outputs: Vec<String>,
    hit: Option<SpawnResult>,
}

impl<'a> DiskHandle<'a> {
    fn populate(&self, scratch: &Path, result: &SpawnResult) -> io::Result<()> {
        for (i, out) in self.outputs.iter().enumerate() {
            std::fs::copy(self.exec_root.join(out), scratch.join(i.to_string()))?;
        }
        std::fs::write(scratch.join("stdout"), &result.stdout)?;
        std::fs::write(scratch.join("stderr"), &result.stderr)?;
        Ok(())
    }
}

impl<'a> CacheHandle for DiskHandle<'a> {
    fn has_result(&self) -> bool {
        self.hit.is_some()
    }

    fn result(&self) -> Option<SpawnResult> {
        self.hit.clone()
    }

    fn will_store(&self) -> bool {
        self.hit.is_none()
    }

    fn store(&mut self, result: &SpawnResult) -> Result<(), ExecError> {
        let scratch = tempfile::Builder::new()
            .prefix(".tmp")
            .tempdir_in(&self.cache.dir)
            .map_err(|err| ExecError::from_io("disk cache", err))?;
        self.populate(scratch.path(), result)
            .map_err(|err| ExecError::from_io("disk cache", err))?;
        let entry = self.cache.entry_dir(&self.key);
        match std::fs::rename(scratch.path(), &entry) {
            Ok(()) => Ok(()),
            // Someone else stored the same entry first.
            Err(_) if entry.exists() => Ok(()),
            Err(err) => Err(ExecError::from_io(entry.display(), err)),
        }
    }
}

impl SpawnCache for DiskSpawnCache {
    fn lookup(
        &self,
        spawn: &Spawn,
        ctx: &SpawnContext,
    ) -> Result<Box<dyn CacheHandle + '_>, ExecError> {
        let key = spawn.digest().to_hex();
        let entry = self.entry_dir(&key);
        let hit = if entry.is_dir() {
            match self.restore(&entry, spawn, ctx.exec_root) {
                Ok(result) => {
                    log::debug!("{}: disk cache hit {}", spawn.owner, key);
                    Some(result)
                }
                Err(err) => {
                    log::warn!("{}: ignoring unreadable disk cache entry {}: {}", spawn.owner, key, err);
                    None
                }
            }
        } else {
            None
        };
        Ok(Box::new(DiskHandle {
            cache: self,
            key,
            exec_root: ctx.exec_root.to_path_buf(),
            outputs: spawn.outputs.clone(),
            hit,
        }))
    }
}
