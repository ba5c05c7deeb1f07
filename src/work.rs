//! Build runner: walks the frozen action graph in dependency order, decides
//! which actions are up to date and hands the rest to their strategies.
//!
//! All bookkeeping happens on the calling thread.  Each started action gets a
//! thread of its own that checks the action cache and, if needed, executes
//! the spawn; it reports back over a channel.
//!
//! Actions with the `exclusive` requirement are held back until nothing else
//! is running or ready, then run one at a time.

use crate::action_cache::{self, ActionCache, CacheEntry, Staleness};
use crate::densemap::{DenseMap, Index};
use crate::fs::{FileState, FileSystem};
use crate::graph::{Action, ActionId, ArtifactId, ArtifactRoot, FrozenActionGraph, Label};
use crate::hash::{self, Digest};
use crate::progress::Progress;
use crate::signal::Interrupt;
use crate::spawn::{
    ExecError, OutputCapture, ProgressStatus, Spawn, SpawnContext, SpawnResult, Status, EXCLUSIVE,
};
use crate::strategy::StrategyRegistry;
use crate::trace;
use rayon::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// How often the scheduler checks for interruption while actions run.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where an action is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionState {
    NotStarted,
    CheckingCache,
    /// The action cache says the outputs are current.
    UpToDate,
    /// Waiting for local resources.
    Scheduling,
    Executing,
    Succeeded,
    NonZeroExit,
    Timeout,
    ExecutionDenied,
    ExecutionFailed,
    Catastrophe,
    /// Never started because an input failed or the build stopped.
    Skipped,
}

const STATE_COUNT: usize = ActionState::Skipped as usize + 1;

impl ActionState {
    pub fn is_finished(self) -> bool {
        !matches!(
            self,
            ActionState::NotStarted
                | ActionState::CheckingCache
                | ActionState::Scheduling
                | ActionState::Executing
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ActionState::NonZeroExit
                | ActionState::Timeout
                | ActionState::ExecutionDenied
                | ActionState::ExecutionFailed
                | ActionState::Catastrophe
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, ActionState::UpToDate | ActionState::Succeeded)
    }

    fn from_status(status: Status) -> Self {
        match status {
            Status::Success => ActionState::Succeeded,
            Status::NonZeroExit => ActionState::NonZeroExit,
            Status::Timeout => ActionState::Timeout,
            Status::ExecutionDenied => ActionState::ExecutionDenied,
            Status::ExecutionFailed => ActionState::ExecutionFailed,
            Status::Catastrophe => ActionState::Catastrophe,
        }
    }
}

/// Counts of wanted actions in each state, for progress display.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateCounts([usize; STATE_COUNT]);

impl StateCounts {
    pub fn get(&self, state: ActionState) -> usize {
        self.0[state as usize]
    }

    pub fn add(&mut self, state: ActionState, delta: isize) {
        let slot = &mut self.0[state as usize];
        *slot = slot.wrapping_add_signed(delta);
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// Actions in a finished state.
    pub fn finished(&self) -> usize {
        self.0
            .iter()
            .enumerate()
            .filter(|&(i, _)| ALL_STATES[i].is_finished())
            .map(|(_, &n)| n)
            .sum()
    }

    pub fn failed(&self) -> usize {
        ALL_STATES
            .iter()
            .filter(|s| s.is_failure())
            .map(|&s| self.get(s))
            .sum()
    }
}

const ALL_STATES: [ActionState; STATE_COUNT] = [
    ActionState::NotStarted,
    ActionState::CheckingCache,
    ActionState::UpToDate,
    ActionState::Scheduling,
    ActionState::Executing,
    ActionState::Succeeded,
    ActionState::NonZeroExit,
    ActionState::Timeout,
    ActionState::ExecutionDenied,
    ActionState::ExecutionFailed,
    ActionState::Catastrophe,
    ActionState::Skipped,
];

#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Actions in flight at once.
    pub jobs: usize,
    pub keep_going: bool,
    /// Log why each executed action wasn't up to date.
    pub explain: bool,
    /// Stream command output to files under this directory instead of
    /// capturing it in memory.
    pub output_dir: Option<PathBuf>,
    /// Environment every spawn starts from; an action's own env wins.
    pub base_env: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        let mut base_env = BTreeMap::new();
        if let Ok(path) = std::env::var("PATH") {
            base_env.insert("PATH".to_string(), path);
        }
        BuildOptions {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            keep_going: false,
            explain: false,
            output_dir: None,
            base_env,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unknown path requested: {0:?}")]
    UnknownArtifact(String),
    #[error("unknown target {0}")]
    UnknownTarget(Label),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// How an action finished, as reported to progress.
#[derive(Debug)]
pub struct ActionOutcome {
    pub state: ActionState,
    pub result: Option<SpawnResult>,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
pub struct BuildSummary {
    pub counts: StateCounts,
    /// Actions whose spawn ran or came from the spawn cache.
    pub executed: usize,
    pub spawn_cache_hits: usize,
    pub up_to_date: usize,
    /// Failure descriptions, in completion order.
    pub failures: Vec<String>,
    /// Entries for every action that executed successfully.
    pub cache_deltas: Vec<(String, CacheEntry)>,
    pub interrupted: bool,
    pub catastrophe: Option<String>,
    /// Requested targets and whether all of their actions succeeded.
    pub targets: Vec<(Label, bool)>,
}

impl BuildSummary {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
            && !self.interrupted
            && self.catastrophe.is_none()
            && self.counts.get(ActionState::Skipped) == 0
    }

    pub fn targets_built(&self) -> usize {
        self.targets.iter().filter(|(_, ok)| *ok).count()
    }

    /// "N of M targets built".
    pub fn report_line(&self) -> String {
        format!(
            "{} of {} targets built",
            self.targets_built(),
            self.targets.len()
        )
    }
}

/// Everything a worker thread needs, all borrowed for the build.
#[derive(Clone, Copy)]
struct Shared<'a> {
    fs: &'a dyn FileSystem,
    registry: &'a StrategyRegistry,
    exec_root: &'a Path,
    cancel: &'a Interrupt,
    options: &'a BuildOptions,
}

/// An action ready to be checked and maybe executed.
struct Job<'a> {
    id: ActionId,
    action: &'a Action,
    inputs: Vec<(String, Digest)>,
    outputs: Vec<String>,
    fingerprint: hash::Fingerprint,
    entry: Option<CacheEntry>,
}

enum Outcome {
    UpToDate(Vec<Digest>),
    Executed {
        result: SpawnResult,
        outputs: Vec<Digest>,
        entry: CacheEntry,
    },
    Failed {
        state: ActionState,
        message: String,
        result: Option<SpawnResult>,
    },
}

enum Msg {
    Status(ActionId, ProgressStatus),
    Explain(ActionId, Staleness),
    Finished {
        id: ActionId,
        tid: usize,
        span: (Instant, Instant),
        outcome: Outcome,
    },
}

/// Hands out small integers to running actions so they land on separate
/// tracks in a trace.
#[derive(Default)]
struct ThreadIds {
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                self.slots.push(true);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Work<'a> {
    graph: &'a FrozenActionGraph,
    fs: &'a dyn FileSystem,
    exec_root: &'a Path,
    cache: &'a ActionCache,
    registry: &'a StrategyRegistry,
    progress: &'a mut dyn Progress,
    options: &'a BuildOptions,
    interrupt: Interrupt,

    states: DenseMap<ActionId, ActionState>,
    wanted: DenseMap<ActionId, bool>,
    /// Known content digests, for sources (as supplied) and for the outputs
    /// of actions finished in this build.
    digests: DenseMap<ArtifactId, Option<FileState>>,
    counts: StateCounts,
    /// Requested targets with the actions they need.
    targets: Vec<(Label, Vec<ActionId>)>,
}

impl<'a> Work<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: &'a FrozenActionGraph,
        fs: &'a dyn FileSystem,
        exec_root: &'a Path,
        cache: &'a ActionCache,
        registry: &'a StrategyRegistry,
        progress: &'a mut dyn Progress,
        options: &'a BuildOptions,
        interrupt: Interrupt,
    ) -> Self {
        let actions = graph.action_count();
        let artifacts = graph.artifact_count();
        Work {
            graph,
            fs,
            exec_root,
            cache,
            registry,
            progress,
            options,
            interrupt,
            states: DenseMap::new_sized(actions, ActionState::NotStarted),
            wanted: DenseMap::new_sized(actions, false),
            digests: DenseMap::new_sized(artifacts, None),
            counts: StateCounts::default(),
            targets: Vec::new(),
        }
    }

    /// Requests an artifact by path.  Sources need no work.
    pub fn want_artifact(&mut self, path: &str) -> Result<(), BuildError> {
        let id = self
            .graph
            .artifact_id(path)
            .ok_or_else(|| BuildError::UnknownArtifact(path.to_string()))?;
        self.want_artifact_id(id);
        Ok(())
    }

    pub fn want_artifact_id(&mut self, id: ArtifactId) {
        if let Some(action) = self.graph.generating_action(id) {
            self.want_action(action);
        }
    }

    /// Requests a target: every action owned by it or by anything it
    /// depends on.  A target counts as built once all of those succeed.
    pub fn want_target(&mut self, label: &Label) -> Result<(), BuildError> {
        let graph = self.graph;
        if graph.target_deps(label).is_none() && graph.actions_owned_by(label).is_empty() {
            return Err(BuildError::UnknownTarget(label.clone()));
        }
        let mut owned = Vec::new();
        for member in graph.target_closure(label) {
            for &id in graph.actions_owned_by(&member) {
                self.want_action(id);
                owned.push(id);
            }
        }
        self.targets.push((label.clone(), owned));
        Ok(())
    }

    fn want_action(&mut self, id: ActionId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if self.wanted[id] {
                continue;
            }
            self.wanted[id] = true;
            self.counts.add(ActionState::NotStarted, 1);
            stack.extend(self.graph.prerequisites(id));
        }
    }

    /// Source artifacts read by wanted actions; their states must be given
    /// through `set_source_state` before `run`.
    pub fn wanted_sources(&self) -> Vec<ArtifactId> {
        let mut seen: DenseMap<ArtifactId, bool> = DenseMap::new_sized(self.digests.len(), false);
        let mut sources = Vec::new();
        for (id, &wanted) in self.wanted.iter() {
            if !wanted {
                continue;
            }
            for &input in self.graph.action(id).inputs() {
                if self.graph.artifact(input).root == ArtifactRoot::Source && !seen[input] {
                    seen[input] = true;
                    sources.push(input);
                }
            }
        }
        sources
    }

    pub fn set_source_state(&mut self, id: ArtifactId, state: FileState) {
        self.digests[id] = Some(state);
    }

    pub fn state(&self, id: ActionId) -> ActionState {
        self.states[id]
    }

    fn set_state(&mut self, id: ActionId, state: ActionState) {
        let graph = self.graph;
        let prev = std::mem::replace(&mut self.states[id], state);
        self.counts.add(prev, -1);
        self.counts.add(state, 1);
        self.progress.action_state(id, graph.action(id), state);
        self.progress.update(&self.counts);
    }

    /// Collects input digests and the cache entry, or explains why the
    /// action can't run.
    fn prepare(&self, id: ActionId) -> Result<Job<'a>, String> {
        let graph: &'a FrozenActionGraph = self.graph;
        let action = graph.action(id);
        let mut inputs = Vec::with_capacity(action.inputs().len());
        for &input in action.inputs() {
            let path = &graph.artifact(input).path;
            match self.digests[input].and_then(|s| s.digest()) {
                Some(digest) => inputs.push((path.clone(), digest)),
                None => return Err(format!("missing input file '{}'", path)),
            }
        }
        let outputs = action
            .outputs()
            .iter()
            .map(|&o| graph.artifact(o).path.clone())
            .collect::<Vec<_>>();
        let fingerprint = hash::action_fingerprint(&action.key, &inputs);
        let entry = self.cache.get(&outputs[0]).cloned();
        Ok(Job {
            id,
            action,
            inputs,
            outputs,
            fingerprint,
            entry,
        })
    }

    /// Runs every wanted action that isn't up to date.  Ordinary action
    /// failures are reported in the summary, not as errors.
    pub fn run(&mut self) -> Result<BuildSummary, BuildError> {
        if let Some(dir) = &self.options.output_dir {
            std::fs::create_dir_all(dir)?;
        }
        let cancel = self.interrupt.child();
        let shared = Shared {
            fs: self.fs,
            registry: self.registry,
            exec_root: self.exec_root,
            cancel: &cancel,
            options: self.options,
        };

        // Count each distinct wanted prerequisite once.
        let mut pending: DenseMap<ActionId, usize> = DenseMap::new_sized(self.states.len(), 0);
        let mut dependents: DenseMap<ActionId, Vec<ActionId>> =
            DenseMap::new_sized(self.states.len(), Vec::new());
        let mut ready = VecDeque::new();
        for (id, &wanted) in self.wanted.iter() {
            if !wanted {
                continue;
            }
            let mut prereqs: Vec<ActionId> = self.graph.prerequisites(id).collect();
            prereqs.sort();
            prereqs.dedup();
            pending[id] = prereqs.len();
            for p in prereqs {
                dependents[p].push(id);
            }
            if pending[id] == 0 {
                ready.push_back(id);
            }
        }
        self.progress.update(&self.counts);

        let mut summary = BuildSummary::default();
        let mut stopping = false;
        let mut running = 0;
        let mut exclusive = VecDeque::new();
        let mut exclusive_running = false;
        let mut tids = ThreadIds::default();
        let (tx, rx) = mpsc::channel::<Msg>();
        let jobs = self.options.jobs.max(1);

        std::thread::scope(|scope| loop {
            if !stopping && self.interrupt.is_set() {
                self.progress.log("interrupted, waiting for running actions");
                summary.interrupted = true;
                stopping = true;
                cancel.trigger();
            }

            while !stopping && !exclusive_running {
                let id = match ready.pop_front() {
                    Some(id) if self.graph.action(id).has_requirement(EXCLUSIVE) => {
                        exclusive.push_back(id);
                        continue;
                    }
                    Some(id) if running < jobs => id,
                    Some(id) => {
                        ready.push_front(id);
                        break;
                    }
                    None if running == 0 => match exclusive.pop_front() {
                        Some(id) => id,
                        None => break,
                    },
                    None => break,
                };
                match self.prepare(id) {
                    Err(message) => {
                        let outcome = Outcome::Failed {
                            state: ActionState::ExecutionFailed,
                            message: format!("{}: {}", self.graph.action(id).describe(), message),
                            result: None,
                        };
                        let now = Instant::now();
                        let next = self.complete(id, 0, (now, now), outcome, &mut summary, &cancel, &mut stopping);
                        for n in self.release(&mut pending, &dependents, id, next) {
                            ready.push_back(n);
                        }
                    }
                    Ok(job) => {
                        self.set_state(id, ActionState::CheckingCache);
                        let tid = tids.claim();
                        let tx = tx.clone();
                        exclusive_running = job.action.has_requirement(EXCLUSIVE);
                        scope.spawn(move || {
                            let start = Instant::now();
                            let outcome = execute(shared, &job, &tx);
                            // Fails only if the build loop is gone.
                            let _ = tx.send(Msg::Finished {
                                id: job.id,
                                tid,
                                span: (start, Instant::now()),
                                outcome,
                            });
                        });
                        running += 1;
                    }
                }
            }

            if running == 0 && (stopping || (ready.is_empty() && exclusive.is_empty())) {
                break;
            }

            let msg = match rx.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => msg,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                // We hold a sender ourselves.
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            match msg {
                Msg::Status(id, status) => {
                    let state = match status {
                        ProgressStatus::Scheduling => ActionState::Scheduling,
                        ProgressStatus::Executing => ActionState::Executing,
                        ProgressStatus::CacheHit => continue,
                    };
                    self.set_state(id, state);
                }
                Msg::Explain(id, reason) => {
                    let line = format!("explain: {}: {}", self.graph.action(id).describe(), reason);
                    log::info!("{}", line);
                    if self.options.explain {
                        self.progress.log(&line);
                    }
                }
                Msg::Finished {
                    id,
                    tid,
                    span,
                    outcome,
                } => {
                    running -= 1;
                    tids.release(tid);
                    exclusive_running = false;
                    let ok = self.complete(id, tid, span, outcome, &mut summary, &cancel, &mut stopping);
                    for n in self.release(&mut pending, &dependents, id, ok) {
                        ready.push_back(n);
                    }
                }
            }
        });

        for id in self.wanted.all_ids().collect::<Vec<_>>() {
            if self.wanted[id] && self.states[id] == ActionState::NotStarted {
                self.set_state(id, ActionState::Skipped);
            }
        }
        summary.counts = self.counts.clone();
        summary.targets = self
            .targets
            .iter()
            .map(|(label, actions)| {
                let built = actions.iter().all(|&a| self.states[a].is_success());
                (label.clone(), built)
            })
            .collect();
        Ok(summary)
    }

    /// Records a finished action.  Returns whether it succeeded.
    #[allow(clippy::too_many_arguments)]
    fn complete(
        &mut self,
        id: ActionId,
        tid: usize,
        span: (Instant, Instant),
        outcome: Outcome,
        summary: &mut BuildSummary,
        cancel: &Interrupt,
        stopping: &mut bool,
    ) -> bool {
        let graph = self.graph;
        let action = graph.action(id);
        let (report, outputs) = match outcome {
            Outcome::UpToDate(outputs) => {
                summary.up_to_date += 1;
                (
                    ActionOutcome {
                        state: ActionState::UpToDate,
                        result: None,
                        message: None,
                    },
                    Some(outputs),
                )
            }
            Outcome::Executed {
                result,
                outputs,
                entry,
            } => {
                summary.executed += 1;
                if result.cache_hit {
                    summary.spawn_cache_hits += 1;
                }
                trace::complete(&action.describe(), tid, span);
                let key = graph.artifact(action.primary_output()).path.clone();
                summary.cache_deltas.push((key, entry));
                (
                    ActionOutcome {
                        state: ActionState::Succeeded,
                        result: Some(result),
                        message: None,
                    },
                    Some(outputs),
                )
            }
            Outcome::Failed {
                state,
                message,
                result,
            } => {
                if result.is_some() {
                    trace::complete(&action.describe(), tid, span);
                }
                match state {
                    ActionState::Catastrophe => {
                        if summary.catastrophe.is_none() {
                            summary.catastrophe = Some(message.clone());
                        }
                        *stopping = true;
                        cancel.trigger();
                    }
                    // Cancelled while running; not a failure of its own.
                    ActionState::Skipped => {}
                    _ => {
                        summary.failures.push(message.clone());
                        if !self.options.keep_going {
                            *stopping = true;
                        }
                    }
                }
                (
                    ActionOutcome {
                        state,
                        result,
                        message: Some(message),
                    },
                    None,
                )
            }
        };

        if let Some(outputs) = &outputs {
            for (&artifact, digest) in action.outputs().iter().zip(outputs) {
                self.digests[artifact] = Some(FileState::File(*digest));
            }
        }
        self.set_state(id, report.state);
        self.progress.action_finished(id, action, &report);
        outputs.is_some()
    }

    /// Releases the dependents of a finished action, returning those that
    /// became ready.  Dependents of a failed action are left unstarted.
    fn release(
        &self,
        pending: &mut DenseMap<ActionId, usize>,
        dependents: &DenseMap<ActionId, Vec<ActionId>>,
        id: ActionId,
        succeeded: bool,
    ) -> Vec<ActionId> {
        if !succeeded {
            return Vec::new();
        }
        let mut ready = Vec::new();
        for &dep in &dependents[id] {
            pending[dep] -= 1;
            if pending[dep] == 0 {
                ready.push(dep);
            }
        }
        ready
    }
}

/// Digests an action's outputs, in parallel for actions with many.
fn digest_outputs(fs: &dyn FileSystem, outputs: &[String]) -> Result<Vec<Digest>, String> {
    outputs
        .par_iter()
        .map(|path| match fs.stat(path) {
            Ok(FileState::File(digest)) => Ok(digest),
            Ok(_) => Err(format!("output '{}' was not created", path)),
            Err(err) => Err(format!("stat {}: {}", path, err)),
        })
        .collect()
}

fn build_spawn(job: &Job, options: &BuildOptions) -> Spawn {
    let action = job.action;
    let mut env = options.base_env.clone();
    env.extend(action.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    Spawn {
        owner: action.owner.to_string(),
        mnemonic: action.mnemonic.clone(),
        progress_message: action.progress_message.clone(),
        argv: action.command.argv(),
        env,
        inputs: job.inputs.clone(),
        outputs: job.outputs.clone(),
        param_files: action.param_file.iter().cloned().collect(),
        requirements: action.requirements.clone(),
        resources: action.resources.clone(),
        timeout: action.timeout,
    }
}

/// Worker side of one action: the cache check, then execution if needed.
fn execute(shared: Shared, job: &Job, tx: &mpsc::Sender<Msg>) -> Outcome {
    let action = job.action;
    let command_fingerprint = &action.key;
    let check = if action.has_requirement(crate::spawn::NO_CACHE) {
        Err(Staleness::NoCache)
    } else {
        action_cache::check(
            job.entry.as_ref(),
            &job.fingerprint,
            command_fingerprint,
            &job.inputs,
            |path| shared.fs.stat(path).ok().and_then(|s| s.digest()),
        )
    };
    let reason = match check {
        Ok(()) => {
            // check() verified every recorded output digest.
            if let Some(entry) = &job.entry {
                return Outcome::UpToDate(entry.outputs.iter().map(|(_, d)| *d).collect());
            }
            Staleness::NoEntry
        }
        Err(reason) => reason,
    };
    let _ = tx.send(Msg::Explain(job.id, reason));

    // Stale outputs must not survive a run that fails to rewrite them.
    for out in &job.outputs {
        if let Err(err) = std::fs::remove_file(shared.exec_root.join(out)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Outcome::Failed {
                    state: ActionState::ExecutionFailed,
                    message: format!("{}: remove stale output {}: {}", action.describe(), out, err),
                    result: None,
                };
            }
        }
    }

    let spawn = build_spawn(job, shared.options);
    let output = match &shared.options.output_dir {
        Some(dir) => OutputCapture::Files {
            stdout: dir.join(format!("{}.stdout", job.id.index())),
            stderr: dir.join(format!("{}.stderr", job.id.index())),
        },
        None => OutputCapture::InMemory,
    };
    let id = job.id;
    let reporter = move |_: usize, status: ProgressStatus| {
        let _ = tx.send(Msg::Status(id, status));
    };
    let ctx = SpawnContext {
        id: job.id.index(),
        exec_root: shared.exec_root,
        interrupt: shared.cancel,
        output,
        reporter: &reporter,
    };
    let strategy = shared.registry.strategy_for(&action.mnemonic);
    log::debug!("{} via {}", action.describe(), strategy.name());

    match strategy.exec(&spawn, &ctx) {
        Ok(result) => match digest_outputs(shared.fs, &job.outputs) {
            Ok(outputs) => {
                let entry = CacheEntry::new(
                    job.fingerprint,
                    *command_fingerprint,
                    job.inputs.clone(),
                    job.outputs.iter().cloned().zip(outputs.iter().copied()).collect(),
                );
                Outcome::Executed {
                    result,
                    outputs,
                    entry,
                }
            }
            Err(message) => Outcome::Failed {
                state: ActionState::ExecutionFailed,
                message: format!("{}: {}", action.describe(), message),
                result: Some(result),
            },
        },
        Err(ExecError::SpawnFailed { result, message }) => Outcome::Failed {
            state: ActionState::from_status(result.status),
            message,
            result: Some(*result),
        },
        Err(ExecError::Interrupted) => Outcome::Failed {
            state: ActionState::Skipped,
            message: format!("{}: interrupted", action.describe()),
            result: None,
        },
        Err(err @ ExecError::Catastrophic(_)) => Outcome::Failed {
            state: ActionState::Catastrophe,
            message: format!("{}: {}", action.describe(), err),
            result: None,
        },
        Err(err @ ExecError::Environmental(_)) => Outcome::Failed {
            state: ActionState::ExecutionFailed,
            message: format!("{}: {}", action.describe(), err),
            result: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;
    use crate::graph::{ActionGraph, ActionSpec, CommandLine};
    use crate::spawn::{SpawnRunner, LOCAL_EXEC_ERROR};
    use crate::strategy::{SpawnStrategy, StrategyRegistry};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Runs commands without processes; the command text picks the behavior.
    #[derive(Default)]
    struct FakeRunner {
        events: Mutex<Vec<String>>,
        running: AtomicUsize,
        most_running: AtomicUsize,
    }

    impl FakeRunner {
        fn behave(&self, spawn: &Spawn, ctx: &SpawnContext) -> Result<SpawnResult, ExecError> {
            match spawn.argv.last().map(String::as_str) {
                Some("fail") => return Ok(SpawnResult::new("fake", Status::NonZeroExit, 1)),
                Some("catastrophe") => {
                    return Ok(SpawnResult::new("fake", Status::Catastrophe, LOCAL_EXEC_ERROR))
                }
                Some("slow") => std::thread::sleep(Duration::from_millis(100)),
                Some("block") => {
                    let deadline = Instant::now() + Duration::from_secs(10);
                    while !ctx.interrupt.is_set() {
                        if Instant::now() > deadline {
                            return Ok(SpawnResult::new("fake", Status::NonZeroExit, 1));
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    return Err(ExecError::Interrupted);
                }
                _ => {}
            }
            for out in &spawn.outputs {
                std::fs::write(ctx.exec_root.join(out), &spawn.owner)
                    .map_err(|err| ExecError::from_io(out, err))?;
            }
            Ok(SpawnResult::new("fake", Status::Success, 0))
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl SpawnRunner for FakeRunner {
        fn name(&self) -> &str {
            "fake"
        }

        fn exec(&self, spawn: &Spawn, ctx: &SpawnContext) -> Result<SpawnResult, ExecError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.most_running.fetch_max(now, Ordering::SeqCst);
            self.events.lock().push(format!("start {}", spawn.owner));
            let result = self.behave(spawn, ctx);
            self.events.lock().push(format!("end {}", spawn.owner));
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Quiet;

    impl Progress for Quiet {
        fn update(&mut self, _counts: &StateCounts) {}
        fn action_state(&mut self, _id: ActionId, _action: &Action, _state: ActionState) {}
        fn action_finished(&mut self, _id: ActionId, _action: &Action, _outcome: &ActionOutcome) {}
        fn log(&mut self, _msg: &str) {}
    }

    struct Fixture {
        dir: tempfile::TempDir,
        graph: FrozenActionGraph,
        runner: Arc<FakeRunner>,
        registry: StrategyRegistry,
    }

    /// One independent action per (name, command); each owns target //:name.
    fn fixture(actions: &[(&str, &str)], exclusive: &[&str]) -> Fixture {
        let mut graph = ActionGraph::new();
        for &(name, command) in actions {
            let mut spec = ActionSpec::new("Fake", CommandLine::Shell(command.to_string()));
            spec.outputs = vec![format!("{}.out", name)];
            if exclusive.contains(&name) {
                spec.requirements.insert(EXCLUSIVE.to_string());
            }
            let owner = Label::parse(&format!("//:{}", name)).unwrap();
            graph.register_action(&owner, spec).unwrap();
        }
        let runner = Arc::new(FakeRunner::default());
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            graph: graph.freeze().unwrap(),
            registry: StrategyRegistry::new(SpawnStrategy::uncached("fake", runner.clone())),
            runner,
        }
    }

    fn build(
        f: &Fixture,
        jobs: usize,
        keep_going: bool,
        interrupt: Interrupt,
    ) -> (BuildSummary, Vec<(String, ActionState)>) {
        let fs = RealFileSystem::new(f.dir.path());
        let cache = ActionCache::in_memory();
        let options = BuildOptions {
            jobs,
            keep_going,
            ..BuildOptions::default()
        };
        let mut progress = Quiet;
        let mut work = Work::new(
            &f.graph,
            &fs,
            f.dir.path(),
            &cache,
            &f.registry,
            &mut progress,
            &options,
            interrupt,
        );
        let owners: Vec<Label> = f
            .graph
            .action_ids()
            .map(|id| f.graph.action(id).owner.clone())
            .collect();
        for owner in &owners {
            work.want_target(owner).unwrap();
        }
        let summary = work.run().unwrap();
        let states = f
            .graph
            .action_ids()
            .map(|id| (f.graph.action(id).owner.name().to_string(), work.state(id)))
            .collect();
        (summary, states)
    }

    fn states(list: &[(&str, ActionState)]) -> Vec<(String, ActionState)> {
        list.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    #[test]
    fn catastrophe_overrides_keep_going() {
        use ActionState::*;
        let f = fixture(&[("long", "block"), ("bad", "catastrophe"), ("later", "ok")], &[]);
        let (summary, finished) = build(&f, 2, true, Interrupt::new());
        assert!(summary.catastrophe.is_some(), "{:?}", summary);
        assert!(!summary.success());
        assert_eq!(
            finished,
            states(&[("long", Skipped), ("bad", Catastrophe), ("later", Skipped)])
        );
        assert!(!f.runner.events().contains(&"start //:later".to_string()));
    }

    #[test]
    fn interrupt_cancels_running_actions() {
        use ActionState::*;
        let f = fixture(&[("a", "block"), ("b", "ok")], &[]);
        let interrupt = Interrupt::new();
        let (summary, finished) = std::thread::scope(|s| {
            let trigger = interrupt.clone();
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                trigger.trigger();
            });
            build(&f, 1, false, interrupt.clone())
        });
        assert!(summary.interrupted);
        assert!(summary.failures.is_empty());
        assert_eq!(finished, states(&[("a", Skipped), ("b", Skipped)]));
        assert_eq!(f.runner.events(), vec!["start //:a", "end //:a"]);
    }

    #[test]
    fn fail_fast_drains_running_actions() {
        use ActionState::*;
        let f = fixture(&[("long", "slow"), ("bad", "fail"), ("later", "ok")], &[]);
        let (summary, finished) = build(&f, 2, false, Interrupt::new());
        assert_eq!(summary.failures.len(), 1, "{:?}", summary.failures);
        assert!(!summary.interrupted);
        assert_eq!(
            finished,
            states(&[("long", Succeeded), ("bad", NonZeroExit), ("later", Skipped)])
        );
        assert!(f.dir.path().join("long.out").exists());
        assert!(!f.runner.events().contains(&"start //:later".to_string()));
    }

    #[test]
    fn exclusive_actions_run_alone_after_the_rest() {
        let f = fixture(
            &[
                ("p1", "slow"),
                ("p2", "slow"),
                ("e1", "slow"),
                ("p3", "slow"),
                ("e2", "slow"),
            ],
            &["e1", "e2"],
        );
        let (summary, finished) = build(&f, 4, false, Interrupt::new());
        assert!(summary.success(), "{:?}", summary);
        assert!(finished.iter().all(|(_, s)| *s == ActionState::Succeeded));

        let events = f.runner.events();
        assert_eq!(events.len(), 10);
        assert!(events[..6].iter().all(|e| e.contains("//:p")), "{:?}", events);
        assert_eq!(
            events[6..],
            ["start //:e1", "end //:e1", "start //:e2", "end //:e2"]
        );
        // The parallel ones did overlap.
        assert!(f.runner.most_running.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn state_counts() {
        let mut counts = StateCounts::default();
        counts.add(ActionState::NotStarted, 3);
        counts.add(ActionState::NotStarted, -2);
        counts.add(ActionState::Succeeded, 1);
        counts.add(ActionState::Timeout, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.finished(), 2);
        assert_eq!(counts.failed(), 1);
    }

    #[test]
    fn report_line() {
        let summary = BuildSummary {
            targets: vec![
                (Label::parse("//a:a").unwrap(), true),
                (Label::parse("//a:b").unwrap(), false),
            ],
            ..Default::default()
        };
        assert_eq!(summary.report_line(), "1 of 2 targets built");
        assert!(summary.success());
    }
}
