//! The memoization store: one record per key, holding the last result, the
//! dependencies its computation read and the reverse edges needed to find
//! what an invalidation affects.
//!
//! Lookups go through a sharded concurrent map; each record has its own
//! lock.  No code path holds two record locks at once.

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Keys name computations.  Two equal keys are the same computation.
pub trait NodeKey: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static> NodeKey for T {}

/// Values are shared with every dependent, so they should be cheap to clone.
/// Equality is what allows an unchanged recomputation to stop propagating.
pub trait NodeValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}
impl<T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static> NodeValue for T {}

#[derive(Debug, Clone)]
pub enum ErrorKind<K> {
    /// The computation itself failed.
    Compute(Arc<anyhow::Error>),
    /// The key (transitively) depends on itself; the path starts and ends
    /// with the same key.
    Cycle(Vec<K>),
    Interrupted,
    /// An evaluator invariant was broken, e.g. a function returned Pending
    /// without asking for anything.
    Internal(String),
}

/// A failed result, attributed to the key whose computation caused it.
#[derive(Debug, Clone)]
pub struct ErrorInfo<K> {
    pub root_cause: K,
    pub kind: ErrorKind<K>,
}

impl<K> ErrorInfo<K> {
    pub fn is_cycle(&self) -> bool {
        matches!(self.kind, ErrorKind::Cycle(_))
    }
}

impl<K: fmt::Display> fmt::Display for ErrorInfo<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Compute(err) => write!(f, "{}: {:#}", self.root_cause, err),
            ErrorKind::Cycle(path) => {
                write!(f, "cycle detected:")?;
                for (i, key) in path.iter().enumerate() {
                    write!(f, "{}{}", if i == 0 { " " } else { " -> " }, key)?;
                }
                Ok(())
            }
            ErrorKind::Interrupted => write!(f, "{}: interrupted", self.root_cause),
            ErrorKind::Internal(msg) => write!(f, "{}: internal error: {}", self.root_cause, msg),
        }
    }
}

pub type NodeResult<K, V> = Result<V, ErrorInfo<K>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The stored result is valid at the current version.
    Clean,
    /// Some transitive dependency may have changed; check before reuse.
    Dirty,
    /// Must be recomputed.
    Changed,
}

/// Called once when a record stops being in flight.
pub type Waiter = Box<dyn FnOnce() + Send>;

pub struct NodeData<K, V> {
    /// None until the first computation completes.
    pub value: Option<NodeResult<K, V>>,
    /// Keys read by the last computation, in the order they were read.
    pub deps: Vec<K>,
    pub rdeps: FxHashSet<K>,
    pub state: NodeState,
    /// Version at which the value last changed.
    pub changed_at: u64,
    /// Version at which the value was last computed or verified.
    pub verified_at: u64,
    /// Id of the evaluation computing or verifying this node.
    pub in_flight: Option<u64>,
    pub waiters: Vec<Waiter>,
}

impl<K, V> NodeData<K, V> {
    fn new() -> Self {
        NodeData {
            value: None,
            deps: Vec::new(),
            rdeps: FxHashSet::default(),
            state: NodeState::Changed,
            changed_at: 0,
            verified_at: 0,
            in_flight: None,
            waiters: Vec::new(),
        }
    }

    /// The stored result, if it can be used as is.
    pub fn clean_result(&self) -> Option<&NodeResult<K, V>> {
        match self.state {
            NodeState::Clean => self.value.as_ref(),
            _ => None,
        }
    }

    pub fn take_waiters(&mut self) -> Vec<Waiter> {
        std::mem::take(&mut self.waiters)
    }
}

pub type NodeEntry<K, V> = Arc<Mutex<NodeData<K, V>>>;

pub struct NodeStore<K, V> {
    nodes: DashMap<K, NodeEntry<K, V>>,
}

impl<K: NodeKey, V: NodeValue> Default for NodeStore<K, V> {
    fn default() -> Self {
        NodeStore {
            nodes: DashMap::new(),
        }
    }
}

impl<K: NodeKey, V: NodeValue> NodeStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<NodeEntry<K, V>> {
        self.nodes.get(key).map(|e| e.value().clone())
    }

    pub fn create_if_absent(&self, key: &K) -> NodeEntry<K, V> {
        if let Some(entry) = self.get(key) {
            return entry;
        }
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(NodeData::new())))
            .value()
            .clone()
    }

    /// Records that `from` read `to`.
    pub fn add_dependency(&self, from: &K, to: &K) {
        self.create_if_absent(to).lock().rdeps.insert(from.clone());
    }

    pub fn remove_dependency(&self, from: &K, to: &K) {
        if let Some(entry) = self.get(to) {
            entry.lock().rdeps.remove(from);
        }
    }

    pub fn mark_changed(&self, key: &K) {
        if let Some(entry) = self.get(key) {
            entry.lock().state = NodeState::Changed;
        }
    }

    /// Marks a clean node dirty, returning whether it was clean.
    pub fn mark_dirty(&self, key: &K) -> bool {
        match self.get(key) {
            Some(entry) => {
                let mut node = entry.lock();
                if node.state == NodeState::Clean {
                    node.state = NodeState::Dirty;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn reverse_deps(&self, key: &K) -> Vec<K> {
        self.get(key)
            .map(|e| e.lock().rdeps.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn deps(&self, key: &K) -> Vec<K> {
        self.get(key)
            .map(|e| e.lock().deps.clone())
            .unwrap_or_default()
    }

    pub fn state(&self, key: &K) -> Option<NodeState> {
        self.get(key).map(|e| e.lock().state)
    }

    pub fn keys(&self) -> Vec<K> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stores a finished computation: the result, the exact deps it read
    /// (reverse edges are brought in line) and the versions.  A value equal
    /// to the previous one keeps its old `changed_at`.  Returns the waiters
    /// to notify.
    pub fn complete(
        &self,
        key: &K,
        result: NodeResult<K, V>,
        deps: Vec<K>,
        version: u64,
    ) -> Vec<Waiter> {
        let entry = self.create_if_absent(key);
        let (old_deps, new_deps, waiters) = {
            let mut node = entry.lock();
            let unchanged = matches!((&node.value, &result), (Some(Ok(old)), Ok(new)) if old == new);
            if !unchanged {
                node.changed_at = version;
            }
            node.value = Some(result);
            node.state = NodeState::Clean;
            node.verified_at = version;
            node.in_flight = None;
            let old_deps = std::mem::replace(&mut node.deps, deps);
            (old_deps, node.deps.clone(), node.take_waiters())
        };
        self.relink(key, &old_deps, &new_deps);
        waiters
    }

    /// Marks a dirty node clean without recomputation.
    pub fn verified(&self, key: &K, version: u64) -> Vec<Waiter> {
        match self.get(key) {
            Some(entry) => {
                let mut node = entry.lock();
                node.state = NodeState::Clean;
                node.verified_at = version;
                node.in_flight = None;
                node.take_waiters()
            }
            None => Vec::new(),
        }
    }

    /// Gives up ownership of an in-flight node, leaving its state as it was.
    pub fn abandon(&self, key: &K, evaluation: u64) -> Vec<Waiter> {
        match self.get(key) {
            Some(entry) => {
                let mut node = entry.lock();
                if node.in_flight == Some(evaluation) {
                    node.in_flight = None;
                }
                node.take_waiters()
            }
            None => Vec::new(),
        }
    }

    fn relink(&self, key: &K, old: &[K], new: &[K]) {
        let old_set: FxHashSet<&K> = old.iter().collect();
        let new_set: FxHashSet<&K> = new.iter().collect();
        for dep in old_set.difference(&new_set) {
            self.remove_dependency(key, dep);
        }
        for dep in new_set.difference(&old_set) {
            self.add_dependency(key, dep);
        }
    }
}
