//! Local resource budget: gates how many local actions may run at once.
//!
//! Resources are a vector of amounts (memory, cpu, local test jobs, plus any
//! named extras).  Acquisition blocks until every dimension fits; the returned
//! handle gives the resources back when dropped, on every exit path.

use crate::signal::Interrupt;
use crate::spawn::ExecError;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::time::Duration;

/// Slack for floating point accumulation when comparing against the budget.
const EPSILON: f64 = 1e-4;

/// How often a blocked acquire re-checks for interruption.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceSet {
    pub memory_mb: f64,
    pub cpu: f64,
    pub local_test_jobs: f64,
    pub extra: BTreeMap<String, f64>,
}

impl ResourceSet {
    pub fn new(memory_mb: f64, cpu: f64, local_test_jobs: f64) -> Self {
        ResourceSet {
            memory_mb,
            cpu,
            local_test_jobs,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, name: &str, amount: f64) -> Self {
        self.extra.insert(name.to_string(), amount);
        self
    }

    /// What an action that declares nothing is assumed to need.
    pub fn default_for_action() -> Self {
        ResourceSet::new(250.0, 1.0, 0.0)
    }

    /// The budget of the local machine, derived from its parallelism.
    pub fn local_machine() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        ResourceSet::new(cpus * 2048.0, cpus, cpus)
    }

    fn dimensions(&self) -> impl Iterator<Item = (&str, f64)> {
        [
            ("memory", self.memory_mb),
            ("cpu", self.cpu),
            ("local_test_jobs", self.local_test_jobs),
        ]
        .into_iter()
        .chain(self.extra.iter().map(|(k, &v)| (k.as_str(), v)))
    }

    fn get(&self, name: &str) -> f64 {
        match name {
            "memory" => self.memory_mb,
            "cpu" => self.cpu,
            "local_test_jobs" => self.local_test_jobs,
            extra => self.extra.get(extra).copied().unwrap_or(0.0),
        }
    }

    fn add(&mut self, other: &ResourceSet, sign: f64) {
        self.memory_mb += sign * other.memory_mb;
        self.cpu += sign * other.cpu;
        self.local_test_jobs += sign * other.local_test_jobs;
        for (k, v) in &other.extra {
            *self.extra.entry(k.clone()).or_insert(0.0) += sign * v;
        }
    }
}

struct State {
    available: ResourceSet,
    used: ResourceSet,
    /// Number of outstanding handles.
    active: usize,
}

impl State {
    /// Each dimension fits if nothing of it is in use (so a request larger
    /// than the whole budget can still run, alone), or if it fits in what's
    /// left.  An unknown extra resource has no budget and never fits
    /// alongside another user of it.
    fn fits(&self, request: &ResourceSet) -> bool {
        request.dimensions().all(|(name, amount)| {
            let used = self.used.get(name);
            amount <= 0.0 || used <= EPSILON || used + amount <= self.available.get(name) + EPSILON
        })
    }
}

pub struct ResourceManager {
    state: Mutex<State>,
    released: Condvar,
}

impl ResourceManager {
    pub fn new(available: ResourceSet) -> Self {
        ResourceManager {
            state: Mutex::new(State {
                available,
                used: ResourceSet::default(),
                active: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub fn set_available(&self, available: ResourceSet) {
        self.state.lock().available = available;
        self.released.notify_all();
    }

    pub fn available(&self) -> ResourceSet {
        self.state.lock().available.clone()
    }

    /// Number of handles currently held.
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Blocks until `request` fits in the budget, then reserves it.
    /// Fails only if `interrupt` fires while waiting.
    pub fn acquire(
        &self,
        owner: &str,
        request: &ResourceSet,
        interrupt: &Interrupt,
    ) -> Result<ResourceHandle<'_>, ExecError> {
        let mut state = self.state.lock();
        let mut logged = false;
        while !state.fits(request) {
            if interrupt.is_set() {
                return Err(ExecError::Interrupted);
            }
            if !logged {
                log::debug!("{} waiting for resources {:?}", owner, request);
                logged = true;
            }
            self.released.wait_for(&mut state, INTERRUPT_POLL);
        }
        state.used.add(request, 1.0);
        state.active += 1;
        Ok(ResourceHandle {
            manager: self,
            resources: request.clone(),
        })
    }

    fn release(&self, resources: &ResourceSet) {
        {
            let mut state = self.state.lock();
            state.used.add(resources, -1.0);
            state.active -= 1;
        }
        self.released.notify_all();
    }
}

/// Resources held by one execution; released on drop.
pub struct ResourceHandle<'a> {
    manager: &'a ResourceManager,
    resources: ResourceSet,
}

impl<'a> ResourceHandle<'a> {
    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }
}

impl<'a> Drop for ResourceHandle<'a> {
    fn drop(&mut self) {
        self.manager.release(&self.resources);
    }
}
