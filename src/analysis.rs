//! The build's keyed computations: file state, parsed manifests and
//! configured targets.
//!
//! A target `//pkg:name` is declared in `pkg/<manifest name>`.  Configuring a
//! target configures its deps first, so a dependency loop between targets
//! surfaces as an evaluator cycle.

use crate::evaluator::{Computed, Env, Functions};
use crate::fs::{FileState, FileSystem};
use crate::graph::{ActionSpec, Label};
use crate::manifest::{self, Manifest};
use anyhow::anyhow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_MANIFEST: &str = "BUILD.kiln";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildKey {
    /// An execution-root-relative source path.
    File(String),
    /// A manifest file, by path.
    Manifest(String),
    ConfiguredTarget(Label),
}

impl fmt::Display for BuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildKey::File(path) => write!(f, "file {}", path),
            BuildKey::Manifest(path) => write!(f, "manifest {}", path),
            BuildKey::ConfiguredTarget(label) => write!(f, "{}", label),
        }
    }
}

/// A target with its deps configured.
#[derive(Debug, PartialEq)]
pub struct ConfiguredTarget {
    pub label: Label,
    pub actions: Vec<ActionSpec>,
    pub deps: Vec<Arc<ConfiguredTarget>>,
}

impl ConfiguredTarget {
    /// This target and everything it depends on, each once, deps first.
    pub fn transitive(self: &Arc<Self>) -> Vec<Arc<ConfiguredTarget>> {
        fn visit(
            t: &Arc<ConfiguredTarget>,
            seen: &mut std::collections::HashSet<Label>,
            out: &mut Vec<Arc<ConfiguredTarget>>,
        ) {
            if !seen.insert(t.label.clone()) {
                return;
            }
            for dep in &t.deps {
                visit(dep, seen, out);
            }
            out.push(t.clone());
        }
        let mut out = Vec::new();
        visit(self, &mut Default::default(), &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildValue {
    File(FileState),
    Manifest(Arc<Manifest>),
    ConfiguredTarget(Arc<ConfiguredTarget>),
}

impl BuildValue {
    pub fn file_state(&self) -> Option<FileState> {
        match self {
            BuildValue::File(state) => Some(*state),
            _ => None,
        }
    }

    pub fn manifest(&self) -> Option<&Arc<Manifest>> {
        match self {
            BuildValue::Manifest(m) => Some(m),
            _ => None,
        }
    }

    pub fn configured_target(&self) -> Option<&Arc<ConfiguredTarget>> {
        match self {
            BuildValue::ConfiguredTarget(t) => Some(t),
            _ => None,
        }
    }
}

pub struct BuildFunctions {
    fs: Arc<dyn FileSystem>,
    manifest_name: String,
}

impl BuildFunctions {
    pub fn new(fs: Arc<dyn FileSystem>, manifest_name: &str) -> Self {
        BuildFunctions {
            fs,
            manifest_name: manifest_name.to_string(),
        }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Where the targets of a package are declared.
    pub fn manifest_path(&self, package: &str) -> String {
        if package.is_empty() {
            self.manifest_name.clone()
        } else {
            format!("{}/{}", package, self.manifest_name)
        }
    }

    fn file(&self, path: &str) -> Computed<BuildValue> {
        match self.fs.stat(path) {
            Ok(state) => Computed::Ready(BuildValue::File(state)),
            Err(err) => Computed::Failed(anyhow!("stat {}: {}", path, err)),
        }
    }

    fn manifest(&self, path: &str, env: &mut Env<'_, BuildKey, BuildValue>) -> Computed<BuildValue> {
        let state = match env.get(&BuildKey::File(path.to_string())) {
            Some(value) => value.file_state(),
            None => return Computed::Pending,
        };
        match state {
            Some(FileState::File(_)) => {}
            _ => return Computed::Failed(anyhow!("no manifest at {}", path)),
        }
        let text = match self.fs.read(path) {
            Ok(bytes) => bytes,
            Err(err) => return Computed::Failed(anyhow!("read {}: {}", path, err)),
        };
        let text = match String::from_utf8(text) {
            Ok(text) => text,
            Err(_) => return Computed::Failed(anyhow!("{}: not valid utf-8", path)),
        };
        match manifest::parse(Path::new(path), &text) {
            Ok(m) => Computed::Ready(BuildValue::Manifest(Arc::new(m))),
            Err(err) => Computed::Failed(err.into()),
        }
    }

    fn configured_target(
        &self,
        label: &Label,
        env: &mut Env<'_, BuildKey, BuildValue>,
    ) -> Computed<BuildValue> {
        let path = self.manifest_path(label.package());
        let manifest = match env.get(&BuildKey::Manifest(path.clone())) {
            Some(BuildValue::Manifest(m)) => m,
            _ => return Computed::Pending,
        };
        let target = match manifest.target(label) {
            Some(t) => t,
            None => return Computed::Failed(anyhow!("no target {} in {}", label, path)),
        };

        let dep_keys: Vec<BuildKey> = target
            .deps
            .iter()
            .map(|d| BuildKey::ConfiguredTarget(d.clone()))
            .collect();
        let values = env.get_many(&dep_keys);
        if env.values_missing() {
            return Computed::Pending;
        }
        let deps = values
            .into_iter()
            .flatten()
            .filter_map(|v| v.configured_target().cloned())
            .collect();

        Computed::Ready(BuildValue::ConfiguredTarget(Arc::new(ConfiguredTarget {
            label: label.clone(),
            actions: target.actions.clone(),
            deps,
        })))
    }
}

impl Functions for BuildFunctions {
    type Key = BuildKey;
    type Value = BuildValue;

    fn compute(&self, key: &BuildKey, env: &mut Env<'_, BuildKey, BuildValue>) -> Computed<BuildValue> {
        match key {
            BuildKey::File(path) => self.file(path),
            BuildKey::Manifest(path) => self.manifest(path, env),
            BuildKey::ConfiguredTarget(label) => self.configured_target(label, env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{EvaluationOptions, Evaluator};
    use crate::hash::Digest;
    use crate::store::ErrorKind;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::io;
    use std::path::PathBuf;

    /// A FileSystem over an in-memory map of path to contents.
    #[derive(Default)]
    pub(crate) struct MemoryFs {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl MemoryFs {
        pub(crate) fn write(&self, path: &str, content: &str) {
            self.files
                .lock()
                .insert(path.to_string(), content.as_bytes().to_vec());
        }
    }

    impl FileSystem for MemoryFs {
        fn resolve(&self, path: &str) -> PathBuf {
            PathBuf::from("/mem").join(path)
        }

        fn read(&self, path: &str) -> io::Result<Vec<u8>> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn stat(&self, path: &str) -> io::Result<FileState> {
            Ok(match self.files.lock().get(path) {
                Some(content) => FileState::File(Digest::of_bytes(content)),
                None => FileState::Missing,
            })
        }
    }

    fn setup() -> (Arc<MemoryFs>, Evaluator<BuildFunctions>) {
        let fs = Arc::new(MemoryFs::default());
        let evaluator = Evaluator::new(BuildFunctions::new(fs.clone(), DEFAULT_MANIFEST));
        (fs, evaluator)
    }

    fn target_key(s: &str) -> BuildKey {
        BuildKey::ConfiguredTarget(Label::parse(s).unwrap())
    }

    #[test]
    fn configures_across_packages() {
        let (fs, evaluator) = setup();
        fs.write(
            "lib/BUILD.kiln",
            "target //lib:a\naction Cc\n  in = a.c\n  out = out/a.o\n  command = cc a.c\n",
        );
        fs.write(
            "BUILD.kiln",
            "target //:bin\n  deps = //lib:a\naction Link\n  in = out/a.o\n  out = out/bin\n  command = cc out/a.o\n",
        );
        let key = target_key("//:bin");
        let result = evaluator.evaluate(&[key.clone()], &EvaluationOptions::default());
        let bin = result.value(&key).unwrap().configured_target().unwrap();
        let all = bin.transitive();
        let labels: Vec<&str> = all.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["//lib:a", "//:bin"]);
        assert_eq!(all[0].actions[0].outputs, vec!["out/a.o"]);
    }

    #[test]
    fn editing_one_manifest_keeps_the_other_package() {
        let (fs, evaluator) = setup();
        fs.write("lib/BUILD.kiln", "target //lib:a\n");
        fs.write("BUILD.kiln", "target //:bin\n  deps = //lib:a\n");
        let key = target_key("//:bin");
        let opts = EvaluationOptions::default();
        evaluator.evaluate(&[key.clone()], &opts);

        // Rewriting with identical content changes nothing downstream.
        fs.write("BUILD.kiln", "target //:bin\n  deps = //lib:a\n");
        evaluator.invalidate([BuildKey::File("BUILD.kiln".into())]);
        let result = evaluator.evaluate(&[key.clone()], &opts);
        assert!(result.value(&key).is_some());
        assert_eq!(result.stats.verified_clean, 2);

        fs.write("BUILD.kiln", "target //:bin\n");
        evaluator.invalidate([BuildKey::File("BUILD.kiln".into())]);
        let result = evaluator.evaluate(&[key.clone()], &opts);
        let bin = result.value(&key).unwrap().configured_target().unwrap();
        assert!(bin.deps.is_empty());
    }

    #[test]
    fn target_cycle_is_reported() {
        let (fs, evaluator) = setup();
        fs.write(
            "BUILD.kiln",
            "target //:a\n  deps = //:b\ntarget //:b\n  deps = //:a\ntarget //:c\n",
        );
        let opts = EvaluationOptions {
            keep_going: true,
            ..Default::default()
        };
        let result = evaluator.evaluate(&[target_key("//:a"), target_key("//:c")], &opts);
        let err = result.get(&target_key("//:a")).unwrap().as_ref().unwrap_err();
        assert!(matches!(&err.kind, ErrorKind::Cycle(path) if path.len() == 3));
        assert!(result.value(&target_key("//:c")).is_some());
    }

    #[test]
    fn parse_and_lookup_errors() {
        let (fs, evaluator) = setup();
        fs.write("BUILD.kiln", "target //:a\n  bogus = 1\n");
        let opts = EvaluationOptions::default();
        let result = evaluator.evaluate(&[target_key("//:a")], &opts);
        let err = result.errors().next().unwrap();
        assert_eq!(err.root_cause, BuildKey::Manifest("BUILD.kiln".into()));
        assert!(err.to_string().contains("BUILD.kiln:2:"), "{}", err);

        let result = evaluator.evaluate(&[target_key("//nowhere:a")], &opts);
        let err = result.errors().next().unwrap();
        assert!(err.to_string().contains("no manifest at nowhere/BUILD.kiln"), "{}", err);
    }
}
