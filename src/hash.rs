//! Content digests and action fingerprints.
//!
//! A single fingerprint over everything that can affect an action's outputs
//! (command line, environment, execution requirements, param file, input
//! contents, output paths) is recorded in the action cache and compared on the
//! next build to decide whether the action is up to date.

use crate::graph::{Action, ActionGraph};
use sha2::{Digest as _, Sha256};
use std::fmt;

pub const DIGEST_SIZE: usize = 32;

/// Separates variable-length fields so that ("ab", "c") and ("a", "bc") hash
/// differently.
const UNIT_SEPARATOR: u8 = 0x1F;

/// A content digest: sha256 plus the size of the hashed content.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Digest {
    pub hash: [u8; DIGEST_SIZE],
    pub size: u64,
}

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest {
            hash: hasher.finalize().into(),
            size: bytes.len() as u64,
        }
    }

    /// Digest a stream, e.g. a file, without reading it all into memory.
    pub fn of_reader<R: std::io::Read>(mut r: R) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(Digest {
            hash: hasher.finalize().into(),
            size,
        })
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.to_hex(), self.size)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest<{}>", self)
    }
}

/// A digest over a structured record rather than file content.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; DIGEST_SIZE]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", &self.to_hex()[..16])
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Incrementally builds a Fingerprint out of typed fields.
#[derive(Default)]
pub struct Fingerprinter(Sha256);

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.0.update((s.len() as u64).to_le_bytes());
        self.0.update(s.as_bytes());
        self
    }

    pub fn write_u64(&mut self, n: u64) -> &mut Self {
        self.0.update(n.to_le_bytes());
        self
    }

    pub fn write_digest(&mut self, digest: &Digest) -> &mut Self {
        self.0.update(digest.hash);
        self.write_u64(digest.size)
    }

    pub fn write_fingerprint(&mut self, fp: &Fingerprint) -> &mut Self {
        self.0.update(fp.0);
        self
    }

    pub fn write_separator(&mut self) -> &mut Self {
        self.0.update([UNIT_SEPARATOR]);
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.0.finalize().into())
    }
}

/// Fingerprint of the parts of an action that don't depend on input content:
/// command line, environment, requirements, param file and output paths.
pub fn command_fingerprint(graph: &ActionGraph, action: &Action) -> Fingerprint {
    let mut fp = Fingerprinter::new();
    fp.write_str(&action.mnemonic);
    fp.write_separator();
    for arg in action.command.argv() {
        fp.write_str(&arg);
    }
    fp.write_separator();
    for (k, v) in &action.env {
        fp.write_str(k).write_str(v);
    }
    fp.write_separator();
    for req in &action.requirements {
        fp.write_str(req);
    }
    fp.write_separator();
    if let Some(param_file) = &action.param_file {
        fp.write_str(&param_file.path).write_str(&param_file.content);
    }
    fp.write_separator();
    for &out in action.outputs() {
        fp.write_str(&graph.artifact(out).path);
    }
    fp.write_separator();
    fp.finish()
}

/// The full action fingerprint: the command fingerprint plus the path and
/// content digest of every input, in declaration order.
/// Prerequisite: every input has a known digest; an action with missing inputs
/// is never up to date, so it makes no sense to fingerprint it.
pub fn action_fingerprint(command: &Fingerprint, inputs: &[(String, Digest)]) -> Fingerprint {
    let mut fp = Fingerprinter::new();
    fp.write_fingerprint(command);
    for (path, digest) in inputs {
        fp.write_str(path).write_digest(digest);
    }
    fp.write_separator();
    fp.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_content() {
        let d = Digest::of_bytes(b"");
        assert_eq!(
            d.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(d.size, 0);
        let streamed = Digest::of_reader(&b"hello"[..]).unwrap();
        assert_eq!(streamed, Digest::of_bytes(b"hello"));
    }

    #[test]
    fn field_boundaries_matter() {
        let mut a = Fingerprinter::new();
        a.write_str("ab").write_str("c");
        let mut b = Fingerprinter::new();
        b.write_str("a").write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn input_content_changes_fingerprint() {
        let cmd = Fingerprinter::new().finish();
        let before = action_fingerprint(&cmd, &[("a.c".into(), Digest::of_bytes(b"int x;"))]);
        let same = action_fingerprint(&cmd, &[("a.c".into(), Digest::of_bytes(b"int x;"))]);
        let after = action_fingerprint(&cmd, &[("a.c".into(), Digest::of_bytes(b"int y;"))]);
        assert_eq!(before, same);
        assert_ne!(before, after);
    }
}
