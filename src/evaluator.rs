//! The incremental evaluator.
//!
//! Computations are plain functions of a key that read other keys through an
//! `Env`.  A read of a value that isn't available yet makes the function
//! return `Computed::Pending`; the evaluator then schedules what was missing
//! and re-runs the function from scratch once all of it is done.  What a
//! function read on its final run becomes its recorded dependencies.
//!
//! A coordinator on the calling thread owns all bookkeeping for one
//! `evaluate` call and hands computations to a pool of workers.  Reuse across
//! calls relies on versions: `invalidate` bumps the graph version and marks
//! nodes Changed (recompute) or Dirty (check deps first).  A dirty node whose
//! deps all kept their `changed_at` is reused without running its function;
//! its deps are checked in the order they were read, and the first one that
//! changed sends it back to its function.

use crate::signal::Interrupt;
use crate::store::{
    ErrorInfo, ErrorKind, NodeKey, NodeResult, NodeState, NodeStore, NodeValue, Waiter,
};
use crate::thread_pool::{scoped_thread_pool, ThreadPoolExecutor};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// How often a coordinator with nothing to do checks for interruption.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The result of one run of a computation function.
pub enum Computed<V> {
    Ready(V),
    /// Some value read through the Env wasn't available; run again later.
    Pending,
    Failed(anyhow::Error),
}

pub trait Functions: Send + Sync {
    type Key: NodeKey;
    type Value: NodeValue;

    fn compute(
        &self,
        key: &Self::Key,
        env: &mut Env<'_, Self::Key, Self::Value>,
    ) -> Computed<Self::Value>;
}

/// A computation's window onto other keys.  Every read is recorded as a
/// dependency, whether or not the value was available.
pub struct Env<'a, K: NodeKey, V: NodeValue> {
    store: &'a NodeStore<K, V>,
    deps: Vec<K>,
    seen: FxHashSet<K>,
    missing: Vec<K>,
    errors: Vec<ErrorInfo<K>>,
}

impl<'a, K: NodeKey, V: NodeValue> Env<'a, K, V> {
    fn new(store: &'a NodeStore<K, V>) -> Self {
        Env {
            store,
            deps: Vec::new(),
            seen: FxHashSet::default(),
            missing: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// The result of `key`, including its error, or None if it isn't
    /// computed yet.
    pub fn get_result(&mut self, key: &K) -> Option<NodeResult<K, V>> {
        let first = self.seen.insert(key.clone());
        if first {
            self.deps.push(key.clone());
        }
        let result = self
            .store
            .get(key)
            .and_then(|entry| entry.lock().clean_result().cloned());
        if first {
            match &result {
                None => self.missing.push(key.clone()),
                Some(Err(err)) => self.errors.push(err.clone()),
                Some(Ok(_)) => {}
            }
        }
        result
    }

    /// The value of `key`; None if it is not computed yet or failed.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_result(key).and_then(Result::ok)
    }

    /// Requests a batch of keys at once, so that all the missing ones are
    /// scheduled together rather than one restart at a time.
    pub fn get_many(&mut self, keys: &[K]) -> Vec<Option<V>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Whether any value read so far wasn't available.  A function that sees
    /// this should return Pending.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty() || !self.errors.is_empty()
    }
}

#[derive(Clone)]
pub struct EvaluationOptions {
    pub keep_going: bool,
    pub parallelism: NonZeroUsize,
    pub interrupt: Interrupt,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        EvaluationOptions {
            keep_going: false,
            parallelism: std::thread::available_parallelism()
                .unwrap_or(NonZeroUsize::MIN),
            interrupt: Interrupt::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Function invocations, restarts included.
    pub computed: usize,
    pub restarts: usize,
    /// Dirty nodes reused without recomputation.
    pub verified_clean: usize,
    /// Dirty nodes that turned out to need recomputation.
    pub verified_changed: usize,
}

pub struct EvaluationResult<K, V> {
    /// One entry per root, in the order requested.
    pub results: Vec<(K, NodeResult<K, V>)>,
    /// The first error hit, which stopped a fail-fast evaluation.
    pub catalyst: Option<ErrorInfo<K>>,
    pub cycles: Vec<Vec<K>>,
    pub stats: Stats,
}

impl<K: NodeKey, V: NodeValue> EvaluationResult<K, V> {
    pub fn get(&self, key: &K) -> Option<&NodeResult<K, V>> {
        self.results.iter().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    pub fn value(&self, key: &K) -> Option<&V> {
        self.get(key).and_then(|r| r.as_ref().ok())
    }

    pub fn has_error(&self) -> bool {
        self.results.iter().any(|(_, r)| r.is_err())
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorInfo<K>> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().err())
    }
}

/// Edges from nodes to the nodes they are blocked on, across all running
/// evaluations.  A new edge that closes a loop is a dependency cycle.
struct WaitGraph<K> {
    edges: FxHashMap<K, FxHashSet<K>>,
}

impl<K: NodeKey> WaitGraph<K> {
    fn new() -> Self {
        WaitGraph {
            edges: FxHashMap::default(),
        }
    }

    /// Adds `from -> to` edges unless one would close a cycle, in which case
    /// nothing is added and the cycle is returned, starting and ending with
    /// `from`.
    fn add<'k>(&mut self, from: &K, to: impl IntoIterator<Item = &'k K>) -> Option<Vec<K>> {
        let targets: Vec<K> = to.into_iter().cloned().collect();
        for target in &targets {
            if let Some(path) = self.path(target, from) {
                let mut cycle = vec![from.clone()];
                cycle.extend(path);
                return Some(cycle);
            }
        }
        self.edges.entry(from.clone()).or_default().extend(targets);
        None
    }

    /// Shortest path from `start` to `goal`, both included.
    fn path(&self, start: &K, goal: &K) -> Option<Vec<K>> {
        let mut prev: FxHashMap<&K, &K> = FxHashMap::default();
        let mut queue = VecDeque::from([start]);
        let mut seen = FxHashSet::from_iter([start]);
        while let Some(node) = queue.pop_front() {
            if node == goal {
                let mut path = vec![node.clone()];
                let mut cur = node;
                while let Some(&p) = prev.get(cur) {
                    path.push(p.clone());
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.edges.get(node).into_iter().flatten() {
                if seen.insert(next) {
                    prev.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn remove(&mut self, from: &K) {
        self.edges.remove(from);
    }
}

pub struct Evaluator<F: Functions> {
    functions: F,
    store: NodeStore<F::Key, F::Value>,
    version: AtomicU64,
    /// Evaluations hold it shared; invalidation exclusively, so the graph
    /// never changes under a running evaluation.
    invalidation: RwLock<()>,
    waits: Mutex<WaitGraph<F::Key>>,
    next_evaluation: AtomicU64,
}

impl<F: Functions> Evaluator<F> {
    pub fn new(functions: F) -> Self {
        Evaluator {
            functions,
            store: NodeStore::new(),
            version: AtomicU64::new(1),
            invalidation: RwLock::new(()),
            waits: Mutex::new(WaitGraph::new()),
            next_evaluation: AtomicU64::new(1),
        }
    }

    pub fn functions(&self) -> &F {
        &self.functions
    }

    pub fn store(&self) -> &NodeStore<F::Key, F::Value> {
        &self.store
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Evaluates `roots`, reusing whatever is still valid from earlier
    /// evaluations.
    pub fn evaluate(
        &self,
        roots: &[F::Key],
        options: &EvaluationOptions,
    ) -> EvaluationResult<F::Key, F::Value> {
        let _shared = self.invalidation.read();
        let id = self.next_evaluation.fetch_add(1, Ordering::SeqCst);
        let version = self.version.load(Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        let result = scoped_thread_pool(options.parallelism, |pool| {
            let mut evaluation = Evaluation {
                ev: self,
                pool,
                id,
                version,
                options,
                tx,
                rx,
                status: FxHashMap::default(),
                parents: FxHashMap::default(),
                queue: VecDeque::new(),
                ready: VecDeque::new(),
                running: 0,
                blocked: 0,
                abort: None,
                catalyst: None,
                cycles: Vec::new(),
                stats: Stats::default(),
            };
            evaluation.run(roots);
            evaluation.into_result(roots)
        });
        log::debug!(
            "evaluation {} at version {}: {:?}",
            id,
            version,
            result.stats
        );
        result
    }

    /// Marks `keys` as changed and everything that transitively depends on
    /// them as dirty.  Waits for running evaluations to finish.
    pub fn invalidate(&self, keys: impl IntoIterator<Item = F::Key>) {
        let _exclusive = self.invalidation.write();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stack = Vec::new();
        let mut changed = 0;
        for key in keys {
            if self.store.get(&key).is_some() {
                self.store.mark_changed(&key);
                changed += 1;
                stack.extend(self.store.reverse_deps(&key));
            }
        }
        let mut seen = FxHashSet::default();
        let mut dirtied = 0;
        while let Some(key) = stack.pop() {
            if !seen.insert(key.clone()) {
                continue;
            }
            if self.store.mark_dirty(&key) {
                dirtied += 1;
            }
            stack.extend(self.store.reverse_deps(&key));
        }
        log::debug!(
            "invalidation to version {}: {} changed, {} dirtied",
            version,
            changed,
            dirtied
        );
    }

    /// Invalidates every stored key matching `predicate`.
    pub fn invalidate_matching(&self, predicate: impl Fn(&F::Key) -> bool) {
        let keys: Vec<F::Key> = self
            .store
            .keys()
            .into_iter()
            .filter(|k| predicate(k))
            .collect();
        self.invalidate(keys);
    }
}

enum Msg<K, V> {
    Computed {
        key: K,
        computed: Computed<V>,
        deps: Vec<K>,
        missing: Vec<K>,
        errors: Vec<ErrorInfo<K>>,
    },
    /// Another evaluation finished with or gave up a key we wanted.
    Released(K),
}

/// Per-evaluation state of a key.
enum Local<K, V> {
    Running,
    /// Blocked on other keys.
    Waiting {
        missing: FxHashSet<K>,
        resume: Resume,
    },
    /// Owned by another evaluation.
    Blocked,
    /// Left unfinished because the evaluation is stopping.
    Stopped,
    Done(NodeResult<K, V>),
}

/// What a waiting key does once the keys it waits on are done.
#[derive(Clone, Copy, Debug)]
enum Resume {
    /// Run the function again.
    Restart,
    /// Carry on checking the old deps of a dirty node from this index.
    Verify(usize),
}

enum Abort<K> {
    Failed(ErrorInfo<K>),
    Interrupted,
}

struct Evaluation<'a, 'p, F: Functions> {
    ev: &'p Evaluator<F>,
    pool: &'a ThreadPoolExecutor<'p>,
    id: u64,
    version: u64,
    options: &'a EvaluationOptions,
    tx: mpsc::Sender<Msg<F::Key, F::Value>>,
    rx: mpsc::Receiver<Msg<F::Key, F::Value>>,
    status: FxHashMap<F::Key, Local<F::Key, F::Value>>,
    /// Keys waiting on each key, within this evaluation.
    parents: FxHashMap<F::Key, Vec<F::Key>>,
    /// Keys to look at.
    queue: VecDeque<F::Key>,
    /// Keys whose awaited deps are all done.
    ready: VecDeque<(F::Key, Resume)>,
    running: usize,
    blocked: usize,
    abort: Option<Abort<F::Key>>,
    catalyst: Option<ErrorInfo<F::Key>>,
    cycles: Vec<Vec<F::Key>>,
    stats: Stats,
}

fn notify(waiters: Vec<Waiter>) {
    for waiter in waiters {
        waiter();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

impl<'a, 'p, F: Functions> Evaluation<'a, 'p, F> {
    fn run(&mut self, roots: &[F::Key]) {
        self.queue.extend(roots.iter().cloned());
        loop {
            if self.abort.is_none() && self.options.interrupt.is_set() {
                log::debug!("evaluation {} interrupted", self.id);
                self.abort = Some(Abort::Interrupted);
            }
            while self.abort.is_none() && !(self.queue.is_empty() && self.ready.is_empty()) {
                if let Some(key) = self.queue.pop_front() {
                    if !self.status.contains_key(&key) {
                        self.visit(key);
                    }
                } else if let Some((key, resume)) = self.ready.pop_front() {
                    self.deps_ready(key, resume);
                }
            }

            if self.running == 0 {
                let roots_done = roots
                    .iter()
                    .all(|r| matches!(self.status.get(r), Some(Local::Done(_))));
                if roots_done || self.abort.is_some() || self.blocked == 0 {
                    break;
                }
            }

            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => self.handle(msg),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                // We hold a sender ourselves.
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        self.release_unfinished();
    }

    fn visit(&mut self, key: F::Key) {
        let entry = self.ev.store.create_if_absent(&key);
        let mut node = entry.lock();
        if let Some(result) = node.clean_result() {
            let result = result.clone();
            drop(node);
            self.done(key, result);
            return;
        }
        if let Some(owner) = node.in_flight {
            if owner != self.id {
                let tx = self.tx.clone();
                let k = key.clone();
                node.waiters.push(Box::new(move || {
                    // The evaluation may have finished meanwhile.
                    let _ = tx.send(Msg::Released(k));
                }));
                drop(node);
                self.status.insert(key, Local::Blocked);
                self.blocked += 1;
                return;
            }
        }
        node.in_flight = Some(self.id);
        if node.state == NodeState::Dirty && node.value.is_some() {
            drop(node);
            self.verify(key, 0);
        } else {
            drop(node);
            self.compute(key);
        }
    }

    fn compute(&mut self, key: F::Key) {
        if self.abort.is_some() {
            self.status.insert(key, Local::Stopped);
            return;
        }
        self.status.insert(key.clone(), Local::Running);
        self.running += 1;
        self.stats.computed += 1;
        let ev = self.ev;
        let tx = self.tx.clone();
        self.pool.execute(move || {
            let mut env = Env::new(&ev.store);
            let computed = match catch_unwind(AssertUnwindSafe(|| ev.functions.compute(&key, &mut env))) {
                Ok(computed) => computed,
                Err(panic) => Computed::Failed(anyhow::anyhow!(
                    "computation panicked: {}",
                    panic_message(&*panic)
                )),
            };
            let _ = tx.send(Msg::Computed {
                key,
                computed,
                deps: env.deps,
                missing: env.missing,
                errors: env.errors,
            });
        });
    }

    /// Blocks `key` until `awaited` are done.  `recorded` are the deps the
    /// last computation read, stored if the wait turns out to be a cycle.
    fn wait_for(
        &mut self,
        key: F::Key,
        recorded: Vec<F::Key>,
        awaited: Vec<F::Key>,
        resume: Resume,
    ) {
        let missing: FxHashSet<F::Key> = awaited
            .into_iter()
            .filter(|d| !matches!(self.status.get(d), Some(Local::Done(_))))
            .collect();
        if missing.is_empty() {
            self.ready.push_back((key, resume));
            return;
        }
        let cycle = self.ev.waits.lock().add(&key, missing.iter());
        if let Some(path) = cycle {
            if let Resume::Verify(_) = resume {
                // Old deps may no longer be needed; only a real computation
                // can tell whether the cycle still exists.
                self.stats.verified_changed += 1;
                self.compute(key);
                return;
            }
            log::debug!("cycle at {}: {:?}", key, path);
            self.cycles.push(path.clone());
            let err = ErrorInfo {
                root_cause: key.clone(),
                kind: ErrorKind::Cycle(path),
            };
            self.finish(key, Err(err), recorded);
            return;
        }
        for dep in &missing {
            self.parents.entry(dep.clone()).or_default().push(key.clone());
            if !self.status.contains_key(dep) {
                self.queue.push_back(dep.clone());
            }
        }
        self.status.insert(key, Local::Waiting { missing, resume });
    }

    fn deps_ready(&mut self, key: F::Key, resume: Resume) {
        self.ev.waits.lock().remove(&key);
        match resume {
            Resume::Restart => {
                log::trace!("restarting {}", key);
                self.stats.restarts += 1;
                self.compute(key);
            }
            Resume::Verify(next) => self.verify(key, next),
        }
    }

    /// Checks the old deps of dirty `key` one at a time, in the order the
    /// last computation read them, starting at `next`.  The first changed dep
    /// triggers a recompute: deps read after it may not be read any more, so
    /// they are never evaluated on its behalf.
    fn verify(&mut self, key: F::Key, mut next: usize) {
        let ev = self.ev;
        let store = &ev.store;
        let (verified_at, deps, value) = match store.get(&key) {
            Some(entry) => {
                let node = entry.lock();
                (node.verified_at, node.deps.clone(), node.value.clone())
            }
            None => (0, Vec::new(), None),
        };
        let Some(value) = value else {
            self.stats.verified_changed += 1;
            self.compute(key);
            return;
        };
        while let Some(dep) = deps.get(next) {
            if !matches!(self.status.get(dep), Some(Local::Done(_))) {
                self.wait_for(key, Vec::new(), vec![dep.clone()], Resume::Verify(next));
                return;
            }
            let changed = match store.get(dep) {
                Some(entry) => {
                    let dep = entry.lock();
                    dep.changed_at > verified_at || !matches!(dep.value, Some(Ok(_)))
                }
                None => true,
            };
            if changed {
                log::trace!("{} changed under {}", dep, key);
                self.stats.verified_changed += 1;
                self.compute(key);
                return;
            }
            next += 1;
        }
        self.stats.verified_clean += 1;
        notify(store.verified(&key, self.version));
        self.done(key, value);
    }

    fn handle(&mut self, msg: Msg<F::Key, F::Value>) {
        match msg {
            Msg::Released(key) => {
                if let Some(Local::Blocked) = self.status.get(&key) {
                    self.blocked -= 1;
                    self.status.remove(&key);
                    self.queue.push_back(key);
                }
            }
            Msg::Computed {
                key,
                computed,
                deps,
                missing,
                errors,
            } => {
                self.running -= 1;
                match computed {
                    Computed::Ready(value) => self.finish(key, Ok(value), deps),
                    Computed::Failed(err) => {
                        let err = ErrorInfo {
                            root_cause: key.clone(),
                            kind: ErrorKind::Compute(Arc::new(err)),
                        };
                        self.finish(key, Err(err), deps)
                    }
                    Computed::Pending => {
                        if !missing.is_empty() {
                            if self.abort.is_some() {
                                self.status.insert(key, Local::Stopped);
                            } else {
                                self.wait_for(key, deps, missing, Resume::Restart);
                            }
                        } else if let Some(err) = errors.into_iter().next() {
                            let err = Self::bubble(&key, err);
                            self.finish(key, Err(err), deps);
                        } else {
                            let err = ErrorInfo {
                                root_cause: key.clone(),
                                kind: ErrorKind::Internal(
                                    "returned Pending without a missing dependency".to_string(),
                                ),
                            };
                            self.finish(key, Err(err), deps);
                        }
                    }
                }
            }
        }
    }

    /// A dep's error as seen from `key`: cycle members report the cycle as
    /// their own; everything else keeps the original root cause.
    fn bubble(key: &F::Key, err: ErrorInfo<F::Key>) -> ErrorInfo<F::Key> {
        match &err.kind {
            ErrorKind::Cycle(path) if path.contains(key) => ErrorInfo {
                root_cause: key.clone(),
                kind: err.kind.clone(),
            },
            _ => err,
        }
    }

    fn finish(&mut self, key: F::Key, result: NodeResult<F::Key, F::Value>, deps: Vec<F::Key>) {
        self.ev.waits.lock().remove(&key);
        notify(
            self.ev
                .store
                .complete(&key, result.clone(), deps, self.version),
        );
        self.done(key, result);
    }

    fn done(&mut self, key: F::Key, result: NodeResult<F::Key, F::Value>) {
        if let Err(err) = &result {
            if self.catalyst.is_none() {
                self.catalyst = Some(err.clone());
            }
            if !self.options.keep_going && self.abort.is_none() {
                log::debug!("evaluation {} stopping after error: {}", self.id, err);
                self.abort = Some(Abort::Failed(err.clone()));
            }
        }
        if let Some(parents) = self.parents.remove(&key) {
            for parent in parents {
                if let Some(Local::Waiting { missing, resume }) = self.status.get_mut(&parent) {
                    missing.remove(&key);
                    if missing.is_empty() {
                        self.ready.push_back((parent, *resume));
                    }
                }
            }
        }
        self.status.insert(key, Local::Done(result));
    }

    /// Hands back every node this evaluation claimed but didn't finish, so a
    /// later evaluation (or one blocked on us) computes it afresh.
    fn release_unfinished(&mut self) {
        let mut released = 0;
        for (key, local) in &self.status {
            match local {
                Local::Done(_) | Local::Blocked => {}
                Local::Running | Local::Waiting { .. } | Local::Stopped => {
                    self.ev.waits.lock().remove(key);
                    notify(self.ev.store.abandon(key, self.id));
                    released += 1;
                }
            }
        }
        if released > 0 {
            log::debug!("evaluation {} abandoned {} nodes", self.id, released);
        }
    }

    fn into_result(self, roots: &[F::Key]) -> EvaluationResult<F::Key, F::Value> {
        let results = roots
            .iter()
            .map(|root| {
                let result = match self.status.get(root) {
                    Some(Local::Done(result)) => result.clone(),
                    _ => Err(match &self.abort {
                        Some(Abort::Failed(err)) => err.clone(),
                        Some(Abort::Interrupted) => ErrorInfo {
                            root_cause: root.clone(),
                            kind: ErrorKind::Interrupted,
                        },
                        None => ErrorInfo {
                            root_cause: root.clone(),
                            kind: ErrorKind::Internal("evaluation stalled".to_string()),
                        },
                    }),
                };
                (root.clone(), result)
            })
            .collect();
        EvaluationResult {
            results,
            catalyst: self.catalyst,
            cycles: self.cycles,
            stats: self.stats,
        }
    }
}
