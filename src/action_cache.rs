//! The action cache records, for each action that ran successfully, the
//! fingerprint it ran with and the digests of what it consumed and produced.
//! It's what makes an unchanged action up to date on the next build.
//!
//! On disk it is a single binary file: a header, a table of paths (each path
//! stored once and referred to by index), then the entries.  The whole file
//! is rewritten at the end of a build, via a temporary file and a rename, so
//! a crash never leaves a half-written cache behind.

use crate::hash::{Digest, Fingerprint, DIGEST_SIZE};
use rustc_hash::FxHashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const MAGIC: &[u8; 9] = b"kilncache";
const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub command_fingerprint: Fingerprint,
    pub inputs: Vec<(String, Digest)>,
    pub outputs: Vec<(String, Digest)>,
    /// Seconds since the epoch at which the entry was recorded.
    pub timestamp: u64,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        command_fingerprint: Fingerprint,
        inputs: Vec<(String, Digest)>,
        outputs: Vec<(String, Digest)>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        CacheEntry {
            fingerprint,
            command_fingerprint,
            inputs,
            outputs,
            timestamp,
        }
    }
}

/// Why an action isn't up to date; what `--explain` prints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    NoEntry,
    NoCache,
    CommandChanged,
    InputChanged(String),
    InputsAddedOrRemoved,
    OutputMissing(String),
    OutputModified(String),
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::NoEntry => write!(f, "no entry in the action cache"),
            Staleness::NoCache => write!(f, "action is marked no-cache"),
            Staleness::CommandChanged => write!(f, "command line or environment changed"),
            Staleness::InputChanged(path) => write!(f, "input '{}' changed", path),
            Staleness::InputsAddedOrRemoved => write!(f, "set of inputs changed"),
            Staleness::OutputMissing(path) => write!(f, "output '{}' is missing", path),
            Staleness::OutputModified(path) => write!(f, "output '{}' was modified", path),
        }
    }
}

/// Compares a stored entry with the action as it would run now.  On an
/// fingerprint mismatch, the finer-grained fields say what changed.
pub fn check(
    entry: Option<&CacheEntry>,
    fingerprint: &Fingerprint,
    command_fingerprint: &Fingerprint,
    inputs: &[(String, Digest)],
    mut output_digest: impl FnMut(&str) -> Option<Digest>,
) -> Result<(), Staleness> {
    let entry = entry.ok_or(Staleness::NoEntry)?;
    if entry.fingerprint != *fingerprint {
        if entry.command_fingerprint != *command_fingerprint {
            return Err(Staleness::CommandChanged);
        }
        if entry.inputs.len() != inputs.len() {
            return Err(Staleness::InputsAddedOrRemoved);
        }
        for ((old_path, old), (path, new)) in entry.inputs.iter().zip(inputs) {
            if old_path != path {
                return Err(Staleness::InputsAddedOrRemoved);
            }
            if old != new {
                return Err(Staleness::InputChanged(path.clone()));
            }
        }
        // Equal fields but a different fingerprint: treat as a command change.
        return Err(Staleness::CommandChanged);
    }
    for (path, recorded) in &entry.outputs {
        match output_digest(path) {
            None => return Err(Staleness::OutputMissing(path.clone())),
            Some(digest) if digest != *recorded => {
                return Err(Staleness::OutputModified(path.clone()))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// The in-memory action cache, keyed by the action's primary output path.
pub struct ActionCache {
    path: Option<PathBuf>,
    entries: FxHashMap<String, CacheEntry>,
    dirty: bool,
}

impl ActionCache {
    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        ActionCache {
            path: None,
            entries: FxHashMap::default(),
            dirty: false,
        }
    }

    /// Loads the cache from `path`.  A missing file is an empty cache; an
    /// unreadable or incompatible one is discarded with a warning, which
    /// only costs rebuilding.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match File::open(&path) {
            Ok(f) => match read(&mut Reader(BufReader::new(f))) {
                Ok(entries) => {
                    log::debug!("loaded {} action cache entries from {}", entries.len(), path.display());
                    entries
                }
                Err(err) => {
                    log::warn!("discarding action cache {}: {}", path.display(), err);
                    FxHashMap::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    log::warn!("discarding action cache {}: {}", path.display(), err);
                }
                FxHashMap::default()
            }
        };
        ActionCache {
            path: Some(path),
            entries,
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges the updates gathered during a build.
    pub fn apply(&mut self, deltas: impl IntoIterator<Item = (String, CacheEntry)>) {
        for (key, entry) in deltas {
            self.entries.insert(key, entry);
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
    }

    /// Writes the cache back if anything changed.
    pub fn save(&mut self) -> io::Result<()> {
        let path = match &self.path {
            Some(path) if self.dirty => path,
            _ => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut w = Writer::new(BufWriter::new(File::create(&tmp)?));
            w.write_all(&self.entries)?;
            w.0.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

struct Writer<W: Write>(W);

impl<W: Write> Writer<W> {
    fn new(w: W) -> Self {
        Writer(w)
    }

    fn u16(&mut self, n: u16) -> io::Result<()> {
        self.0.write_all(&n.to_le_bytes())
    }

    fn u32(&mut self, n: u32) -> io::Result<()> {
        self.0.write_all(&n.to_le_bytes())
    }

    fn u64(&mut self, n: u64) -> io::Result<()> {
        self.0.write_all(&n.to_le_bytes())
    }

    fn str(&mut self, s: &str) -> io::Result<()> {
        let len: u16 = s
            .len()
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path too long"))?;
        self.u16(len)?;
        self.0.write_all(s.as_bytes())
    }

    fn digest(&mut self, d: &Digest) -> io::Result<()> {
        self.0.write_all(&d.hash)?;
        self.u64(d.size)
    }

    fn write_all(&mut self, entries: &FxHashMap<String, CacheEntry>) -> io::Result<()> {
        // Path table first, so entries can refer to paths by index.
        let mut ids: FxHashMap<&str, u32> = FxHashMap::default();
        let mut paths: Vec<&str> = Vec::new();
        for (key, entry) in entries {
            let all = std::iter::once(key.as_str())
                .chain(entry.inputs.iter().map(|(p, _)| p.as_str()))
                .chain(entry.outputs.iter().map(|(p, _)| p.as_str()));
            for p in all {
                if !ids.contains_key(p) {
                    ids.insert(p, paths.len() as u32);
                    paths.push(p);
                }
            }
        }

        self.0.write_all(MAGIC)?;
        self.u32(VERSION)?;
        self.u32(paths.len() as u32)?;
        for p in &paths {
            self.str(p)?;
        }
        self.u32(entries.len() as u32)?;
        for (key, entry) in entries {
            self.u32(ids[key.as_str()])?;
            self.0.write_all(&entry.fingerprint.0)?;
            self.0.write_all(&entry.command_fingerprint.0)?;
            self.u64(entry.timestamp)?;
            for list in [&entry.inputs, &entry.outputs] {
                self.u32(list.len() as u32)?;
                for (p, d) in list {
                    self.u32(ids[p.as_str()])?;
                    self.digest(d)?;
                }
            }
        }
        self.0.flush()
    }
}

struct Reader<R: Read>(R);

fn corrupt(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_string())
}

impl<R: Read> Reader<R> {
    fn bytes<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.0.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u16(&mut self) -> io::Result<u16> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn str(&mut self) -> io::Result<String> {
        let len = self.u16()? as usize;
        let mut buf = vec![0u8; len];
        self.0.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| corrupt("path is not utf-8"))
    }

    fn digest(&mut self) -> io::Result<Digest> {
        let hash = self.bytes::<DIGEST_SIZE>()?;
        Ok(Digest {
            hash,
            size: self.u64()?,
        })
    }
}

fn read<R: Read>(r: &mut Reader<R>) -> io::Result<FxHashMap<String, CacheEntry>> {
    if &r.bytes::<9>()? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(corrupt(&format!("version {}, expected {}", version, VERSION)));
    }
    let path_count = r.u32()? as usize;
    let mut paths = Vec::with_capacity(path_count.min(1 << 16));
    for _ in 0..path_count {
        paths.push(r.str()?);
    }
    let path = |id: u32| -> io::Result<String> {
        paths
            .get(id as usize)
            .cloned()
            .ok_or_else(|| corrupt("path index out of range"))
    };

    let entry_count = r.u32()? as usize;
    let mut entries = FxHashMap::default();
    for _ in 0..entry_count {
        let key = path(r.u32()?)?;
        let fingerprint = Fingerprint(r.bytes()?);
        let command_fingerprint = Fingerprint(r.bytes()?);
        let timestamp = r.u64()?;
        let mut lists = [Vec::new(), Vec::new()];
        for list in lists.iter_mut() {
            let n = r.u32()?;
            for _ in 0..n {
                let p = path(r.u32()?)?;
                list.push((p, r.digest()?));
            }
        }
        let [inputs, outputs] = lists;
        entries.insert(
            key,
            CacheEntry {
                fingerprint,
                command_fingerprint,
                inputs,
                outputs,
                timestamp,
            },
        );
    }
    Ok(entries)
}
