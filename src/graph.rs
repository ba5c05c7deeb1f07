//! The action graph: artifacts (files) and the actions that generate them.
//!
//! Analysis registers actions one by one; edges between actions are never
//! stated, they follow from one action's output being another's input.
//! Once analysis is done the graph is frozen, checked for cycles, and handed
//! to the builder read-only.

use crate::canon::{canon_path, is_exec_relative};
use crate::densemap::{self, DenseMap};
use crate::hash::{self, Fingerprint};
use crate::resources::ResourceSet;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ArtifactId(u32);
impl densemap::Index for ArtifactId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for ArtifactId {
    fn from(u: usize) -> ArtifactId {
        ArtifactId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ActionId(u32);
impl densemap::Index for ActionId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for ActionId {
    fn from(u: usize) -> ActionId {
        ActionId(u as u32)
    }
}

/// A target label, `//package:name`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Label(String);

impl Label {
    pub fn parse(s: &str) -> Option<Label> {
        let rest = s.strip_prefix("//")?;
        let (package, name) = rest.split_once(':')?;
        let valid = |part: &str| {
            part.chars()
                .all(|c| c.is_ascii_alphanumeric() || "/_-.+".contains(c))
        };
        if name.is_empty() || !valid(package) || !valid(name) || name.contains('/') {
            return None;
        }
        Some(Label(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory part, empty for the root package.
    pub fn package(&self) -> &str {
        let colon = self.0.find(':').unwrap_or(self.0.len());
        &self.0[2..colon]
    }

    pub fn name(&self) -> &str {
        let colon = self.0.find(':').map_or(self.0.len(), |i| i + 1);
        &self.0[colon..]
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArtifactRoot {
    /// Checked in; read from the source tree.
    Source,
    /// Produced by exactly one action.
    Derived,
}

#[derive(Debug)]
pub struct Artifact {
    /// Canonical path relative to the execution root.
    pub path: String,
    pub root: ArtifactRoot,
    pub generating_action: Option<ActionId>,
    /// Actions that read this artifact.
    pub dependents: Vec<ActionId>,
}

/// A file written just before the command runs, typically holding arguments
/// too long for a command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Run through `/bin/sh -c`.
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Shell(cmd) => vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()],
            CommandLine::Argv(argv) => argv.clone(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(cmd) => f.write_str(cmd),
            CommandLine::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// An action as declared by analysis, before its paths are interned.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub mnemonic: String,
    pub progress_message: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub command: CommandLine,
    pub env: BTreeMap<String, String>,
    pub requirements: BTreeSet<String>,
    pub resources: ResourceSet,
    pub timeout: Option<Duration>,
    pub param_file: Option<ParamFile>,
}

impl ActionSpec {
    pub fn new(mnemonic: &str, command: CommandLine) -> Self {
        ActionSpec {
            mnemonic: mnemonic.to_string(),
            progress_message: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            command,
            env: BTreeMap::new(),
            requirements: BTreeSet::new(),
            resources: ResourceSet::default_for_action(),
            timeout: None,
            param_file: None,
        }
    }
}

#[derive(Debug)]
pub struct Action {
    pub owner: Label,
    pub mnemonic: String,
    pub progress_message: String,
    inputs: Vec<ArtifactId>,
    outputs: Vec<ArtifactId>,
    pub command: CommandLine,
    pub env: BTreeMap<String, String>,
    pub requirements: BTreeSet<String>,
    pub resources: ResourceSet,
    pub timeout: Option<Duration>,
    pub param_file: Option<ParamFile>,
    /// Fingerprint of everything about the action except input contents.
    pub key: Fingerprint,
}

impl Action {
    pub fn inputs(&self) -> &[ArtifactId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArtifactId] {
        &self.outputs
    }

    /// The output whose path names the action in the action cache.
    pub fn primary_output(&self) -> ArtifactId {
        self.outputs[0]
    }

    pub fn has_requirement(&self, req: &str) -> bool {
        self.requirements.contains(req)
    }

    /// Message shown while the action runs.
    pub fn describe(&self) -> String {
        if self.progress_message.is_empty() {
            format!("{} {}", self.mnemonic, self.owner)
        } else {
            self.progress_message.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionConflict {
    #[error("file '{path}' is generated by both {first} and {second}")]
    DuplicateGenerator {
        path: String,
        first: Label,
        second: Label,
    },
    #[error("{owner}: output '{path}' is listed twice")]
    RepeatedOutput { owner: Label, path: String },
    #[error("{owner}: {mnemonic} action declares no outputs")]
    NoOutputs { owner: Label, mnemonic: String },
    #[error("{owner}: '{path}' is not under the execution root")]
    OutsideExecRoot { owner: Label, path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ActionGraphError {
    #[error(transparent)]
    Conflict(#[from] ActionConflict),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[derive(Default)]
pub struct ActionGraph {
    artifacts: DenseMap<ArtifactId, Artifact>,
    actions: DenseMap<ActionId, Action>,
    by_path: FxHashMap<String, ArtifactId>,
    by_owner: BTreeMap<Label, Vec<ActionId>>,
    /// Declared targets and their direct deps.
    targets: BTreeMap<Label, Vec<Label>>,
}

impl ActionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, canon: String) -> ArtifactId {
        if let Some(&id) = self.by_path.get(&canon) {
            return id;
        }
        let id = self.artifacts.push(Artifact {
            path: canon.clone(),
            root: ArtifactRoot::Source,
            generating_action: None,
            dependents: Vec::new(),
        });
        self.by_path.insert(canon, id);
        id
    }

    /// Adds an action.  Everything is validated before anything is mutated,
    /// so a conflicting registration leaves the graph unchanged.
    pub fn register_action(
        &mut self,
        owner: &Label,
        spec: ActionSpec,
    ) -> Result<ActionId, ActionConflict> {
        if spec.outputs.is_empty() {
            return Err(ActionConflict::NoOutputs {
                owner: owner.clone(),
                mnemonic: spec.mnemonic,
            });
        }
        let canon_ins: Vec<String> = spec.inputs.iter().map(canon_path).collect();
        let canon_outs: Vec<String> = spec.outputs.iter().map(canon_path).collect();
        let mut seen = BTreeSet::new();
        for path in canon_outs.iter().chain(canon_ins.iter()) {
            if !is_exec_relative(path) {
                return Err(ActionConflict::OutsideExecRoot {
                    owner: owner.clone(),
                    path: path.clone(),
                });
            }
        }
        for path in &canon_outs {
            if !seen.insert(path.as_str()) {
                return Err(ActionConflict::RepeatedOutput {
                    owner: owner.clone(),
                    path: path.clone(),
                });
            }
            if let Some(&existing) = self.by_path.get(path) {
                if let Some(generator) = self.artifacts[existing].generating_action {
                    return Err(ActionConflict::DuplicateGenerator {
                        path: path.clone(),
                        first: self.actions[generator].owner.clone(),
                        second: owner.clone(),
                    });
                }
            }
        }

        let id = self.actions.next_id();
        let mut inputs = Vec::with_capacity(canon_ins.len());
        for path in canon_ins {
            let aid = self.intern(path);
            if !inputs.contains(&aid) {
                self.artifacts[aid].dependents.push(id);
                inputs.push(aid);
            }
        }
        let mut outputs = Vec::with_capacity(canon_outs.len());
        for path in canon_outs {
            let aid = self.intern(path);
            let artifact = &mut self.artifacts[aid];
            artifact.generating_action = Some(id);
            artifact.root = ArtifactRoot::Derived;
            outputs.push(aid);
        }

        let mut action = Action {
            owner: owner.clone(),
            mnemonic: spec.mnemonic,
            progress_message: spec.progress_message,
            inputs,
            outputs,
            command: spec.command,
            env: spec.env,
            requirements: spec.requirements,
            resources: spec.resources,
            timeout: spec.timeout,
            param_file: spec.param_file,
            key: Fingerprint([0; hash::DIGEST_SIZE]),
        };
        action.key = hash::command_fingerprint(self, &action);
        self.actions.push(action);
        self.by_owner.entry(owner.clone()).or_default().push(id);
        Ok(id)
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id]
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        &self.artifacts[id]
    }

    pub fn artifact_id(&self, path: &str) -> Option<ArtifactId> {
        self.by_path.get(&canon_path(path)).copied()
    }

    pub fn generating_action(&self, id: ArtifactId) -> Option<ActionId> {
        self.artifacts[id].generating_action
    }

    pub fn dependents(&self, id: ArtifactId) -> &[ActionId] {
        &self.artifacts[id].dependents
    }

    pub fn source_artifacts(&self) -> impl Iterator<Item = ArtifactId> + '_ {
        self.artifacts
            .iter()
            .filter(|(_, a)| a.root == ArtifactRoot::Source)
            .map(|(id, _)| id)
    }

    /// Declares a target, which may own no actions of its own.
    pub fn register_target(&mut self, label: Label, deps: Vec<Label>) {
        self.targets.insert(label, deps);
    }

    pub fn target_deps(&self, label: &Label) -> Option<&[Label]> {
        self.targets.get(label).map(|v| v.as_slice())
    }

    /// A declared target and everything it depends on, each once.
    pub fn target_closure(&self, label: &Label) -> Vec<Label> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![label.clone()];
        let mut out = Vec::new();
        while let Some(l) = stack.pop() {
            if !seen.insert(l.clone()) {
                continue;
            }
            if let Some(deps) = self.targets.get(&l) {
                stack.extend(deps.iter().cloned());
            }
            out.push(l);
        }
        out
    }

    pub fn actions_owned_by(&self, label: &Label) -> &[ActionId] {
        self.by_owner.get(label).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn action_ids(&self) -> impl Iterator<Item = ActionId> {
        self.actions.all_ids()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Actions that must complete before `id` can run.
    pub fn prerequisites(&self, id: ActionId) -> impl Iterator<Item = ActionId> + '_ {
        self.actions[id]
            .inputs
            .iter()
            .filter_map(|&input| self.artifacts[input].generating_action)
    }

    /// Checks the derived action-to-action edges for cycles and seals the graph.
    pub fn freeze(self) -> Result<FrozenActionGraph, ActionGraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }
        let mut marks: DenseMap<ActionId, Mark> = DenseMap::new_sized(self.actions.len(), Mark::New);
        for root in self.actions.all_ids() {
            if marks[root] != Mark::New {
                continue;
            }
            // Iterative DFS; the stack holds the active path.
            let mut stack: Vec<(ActionId, Vec<ActionId>)> = Vec::new();
            marks[root] = Mark::Active;
            stack.push((root, self.prerequisites(root).collect()));
            while let Some((id, pending)) = stack.last_mut() {
                let id = *id;
                match pending.pop() {
                    None => {
                        marks[id] = Mark::Done;
                        stack.pop();
                    }
                    Some(next) => match marks[next] {
                        Mark::Done => {}
                        Mark::New => {
                            marks[next] = Mark::Active;
                            let prereqs = self.prerequisites(next).collect();
                            stack.push((next, prereqs));
                        }
                        Mark::Active => {
                            let start = stack.iter().position(|(a, _)| *a == next).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|(a, _)| self.primary_path(*a))
                                .collect();
                            cycle.push(self.primary_path(next));
                            return Err(ActionGraphError::Cycle(cycle));
                        }
                    },
                }
            }
        }
        Ok(FrozenActionGraph(self))
    }

    fn primary_path(&self, id: ActionId) -> String {
        self.artifacts[self.actions[id].primary_output()].path.clone()
    }
}

/// An action graph that passed validation; read-only from here on.
pub struct FrozenActionGraph(ActionGraph);

impl std::ops::Deref for FrozenActionGraph {
    type Target = ActionGraph;
    fn deref(&self) -> &ActionGraph {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> Label {
        Label::parse(s).unwrap()
    }

    fn spec(ins: &[&str], outs: &[&str]) -> ActionSpec {
        let mut spec = ActionSpec::new("Genrule", CommandLine::Shell("true".into()));
        spec.inputs = ins.iter().map(|s| s.to_string()).collect();
        spec.outputs = outs.iter().map(|s| s.to_string()).collect();
        spec
    }

    #[test]
    fn labels() {
        assert!(Label::parse("//lib:a").is_some());
        assert!(Label::parse("//:top").is_some());
        assert!(Label::parse("lib:a").is_none());
        assert!(Label::parse("//lib").is_none());
        assert!(Label::parse("//lib:").is_none());
        let l = label("//lib/sub:a");
        assert_eq!((l.package(), l.name()), ("lib/sub", "a"));
        assert_eq!(label("//:top").package(), "");
    }

    #[test]
    fn derived_edges() {
        let mut g = ActionGraph::new();
        let compile = g
            .register_action(&label("//lib:a"), spec(&["a.c"], &["out/a.o"]))
            .unwrap();
        let link = g
            .register_action(&label("//bin:b"), spec(&["out/./a.o"], &["out/bin"]))
            .unwrap();
        let g = g.freeze().unwrap();

        let a_o = g.artifact_id("out/a.o").unwrap();
        assert_eq!(g.generating_action(a_o), Some(compile));
        assert_eq!(g.dependents(a_o), &[link]);
        assert_eq!(g.prerequisites(link).collect::<Vec<_>>(), vec![compile]);
        let sources: Vec<&str> = g
            .source_artifacts()
            .map(|id| g.artifact(id).path.as_str())
            .collect();
        assert_eq!(sources, vec!["a.c"]);
        assert_eq!(g.actions_owned_by(&label("//bin:b")), &[link]);
        assert!(g.actions_owned_by(&label("//nope:x")).is_empty());
    }

    #[test]
    fn target_closure() {
        let mut g = ActionGraph::new();
        g.register_target(label("//:all"), vec![label("//lib:a"), label("//bin:b")]);
        g.register_target(label("//bin:b"), vec![label("//lib:a")]);
        g.register_target(label("//lib:a"), vec![]);
        let mut closure = g.target_closure(&label("//:all"));
        closure.sort();
        assert_eq!(closure, vec![label("//:all"), label("//bin:b"), label("//lib:a")]);
        assert_eq!(g.target_deps(&label("//bin:b")), Some(&[label("//lib:a")][..]));
        assert_eq!(g.target_deps(&label("//nope:x")), None);
    }

    #[test]
    fn conflicting_outputs() {
        let mut g = ActionGraph::new();
        g.register_action(&label("//lib:a"), spec(&[], &["out/x"]))
            .unwrap();
        let err = g
            .register_action(&label("//lib:b"), spec(&["in"], &["out/y", "out/x"]))
            .unwrap_err();
        assert_eq!(
            err,
            ActionConflict::DuplicateGenerator {
                path: "out/x".into(),
                first: label("//lib:a"),
                second: label("//lib:b"),
            }
        );
        // The failed registration left nothing behind.
        assert_eq!(g.action_count(), 1);
        assert!(g.artifact_id("out/y").is_none());
        assert!(g.artifact_id("in").is_none());
    }

    #[test]
    fn malformed_actions() {
        let mut g = ActionGraph::new();
        let owner = label("//lib:a");
        assert!(matches!(
            g.register_action(&owner, spec(&[], &[])),
            Err(ActionConflict::NoOutputs { .. })
        ));
        assert!(matches!(
            g.register_action(&owner, spec(&[], &["x", "./x"])),
            Err(ActionConflict::RepeatedOutput { .. })
        ));
        assert!(matches!(
            g.register_action(&owner, spec(&["../outside"], &["x"])),
            Err(ActionConflict::OutsideExecRoot { .. })
        ));
    }

    #[test]
    fn freeze_detects_cycle() {
        let mut g = ActionGraph::new();
        g.register_action(&label("//c:a"), spec(&["b"], &["a"]))
            .unwrap();
        g.register_action(&label("//c:b"), spec(&["a"], &["b"]))
            .unwrap();
        match g.freeze() {
            Err(ActionGraphError::Cycle(path)) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
            }
            Err(other) => panic!("unexpected {}", other),
            Ok(_) => panic!("cycle not detected"),
        }
    }

    #[test]
    fn key_tracks_command() {
        let mut g = ActionGraph::new();
        let a = g
            .register_action(&label("//k:a"), spec(&[], &["a"]))
            .unwrap();
        let mut other = spec(&[], &["b"]);
        other.command = CommandLine::Shell("false".into());
        let b = g.register_action(&label("//k:b"), other).unwrap();
        assert_ne!(g.action(a).key, g.action(b).key);
    }
}
