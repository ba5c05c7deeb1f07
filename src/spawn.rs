//! The contract between the builder and whatever executes a command.
//!
//! A Spawn is one attempt at running an action's command; it is built fresh
//! from the action and its resolved input digests.  Runners execute spawns,
//! caches short-circuit them, and both report back a SpawnResult.

use crate::graph::ParamFile;
use crate::hash::{Digest, Fingerprint, Fingerprinter};
use crate::resources::ResourceSet;
use crate::signal::Interrupt;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exit code reported for a command killed because it ran too long,
/// mirroring what a shell reports for SIGALRM.
pub const POSIX_TIMEOUT_EXIT_CODE: i32 = 128 + 14;

/// Exit code reported when the command never ran.
pub const LOCAL_EXEC_ERROR: i32 = -1;

/// Execution requirement: never look up or store results in any cache.
pub const NO_CACHE: &str = "no-cache";

/// Execution requirement: run with nothing else in flight, after every
/// other runnable action has finished.
pub const EXCLUSIVE: &str = "exclusive";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    NonZeroExit,
    Timeout,
    /// Policy forbade running the command here.
    ExecutionDenied,
    /// The command couldn't be started.
    ExecutionFailed,
    /// The machine is in a state where continuing the build is pointless.
    Catastrophe,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

#[derive(Clone, Debug)]
pub struct SpawnResult {
    pub status: Status,
    pub exit_code: i32,
    pub wall_time: Duration,
    /// Only known when the command ran locally and rusage was available.
    pub user_time: Option<Duration>,
    pub system_time: Option<Duration>,
    pub runner_name: String,
    pub cache_hit: bool,
    /// Captured output, when it was captured in memory.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Extra detail for statuses that don't come from the command itself.
    pub failure_message: Option<String>,
}

impl SpawnResult {
    pub fn new(runner_name: &str, status: Status, exit_code: i32) -> Self {
        SpawnResult {
            status,
            exit_code,
            wall_time: Duration::ZERO,
            user_time: None,
            system_time: None,
            runner_name: runner_name.to_string(),
            cache_hit: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            failure_message: None,
        }
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.failure_message = Some(msg.into());
        self
    }

    /// Human-readable reason for a failed result.
    pub fn describe_failure(&self) -> String {
        let detail = match self.status {
            Status::Success => return "succeeded".to_string(),
            Status::NonZeroExit => format!("exit {}", self.exit_code),
            Status::Timeout => "timed out".to_string(),
            Status::ExecutionDenied => "execution denied".to_string(),
            Status::ExecutionFailed => "failed to start".to_string(),
            Status::Catastrophe => "catastrophic failure".to_string(),
        };
        match &self.failure_message {
            Some(msg) => format!("{}: {}", detail, msg),
            None => detail,
        }
    }
}

/// One attempt at executing an action.
#[derive(Clone, Debug)]
pub struct Spawn {
    /// Label of the target that owns the action.
    pub owner: String,
    pub mnemonic: String,
    pub progress_message: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Execution-root-relative input paths with their content digests.
    pub inputs: Vec<(String, Digest)>,
    pub outputs: Vec<String>,
    pub param_files: Vec<ParamFile>,
    pub requirements: BTreeSet<String>,
    pub resources: ResourceSet,
    pub timeout: Option<Duration>,
}

impl Spawn {
    pub fn has_requirement(&self, req: &str) -> bool {
        self.requirements.contains(req)
    }

    pub fn may_cache(&self) -> bool {
        !self.has_requirement(NO_CACHE)
    }

    /// Content address of the spawn: two spawns with the same digest produce
    /// the same outputs.
    pub fn digest(&self) -> Fingerprint {
        let mut fp = Fingerprinter::new();
        for arg in &self.argv {
            fp.write_str(arg);
        }
        fp.write_separator();
        for (k, v) in &self.env {
            fp.write_str(k).write_str(v);
        }
        fp.write_separator();
        for (path, digest) in &self.inputs {
            fp.write_str(path).write_digest(digest);
        }
        fp.write_separator();
        for pf in &self.param_files {
            fp.write_str(&pf.path).write_str(&pf.content);
        }
        fp.write_separator();
        for out in &self.outputs {
            fp.write_str(out);
        }
        fp.finish()
    }
}

/// Lifecycle points a runner reports for its spawn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Waiting for local resources.
    Scheduling,
    Executing,
    /// Satisfied from a cache.
    CacheHit,
}

/// Where a command's output goes.
#[derive(Clone, Debug, Default)]
pub enum OutputCapture {
    #[default]
    InMemory,
    /// Stream into files, e.g. for commands with very large output.
    Files { stdout: PathBuf, stderr: PathBuf },
}

/// Per-execution environment handed to strategies.
pub struct SpawnContext<'a> {
    /// Stable id of the action being executed, for reporting.
    pub id: usize,
    pub exec_root: &'a Path,
    pub interrupt: &'a Interrupt,
    pub output: OutputCapture,
    pub reporter: &'a (dyn Fn(usize, ProgressStatus) + Sync),
}

impl<'a> SpawnContext<'a> {
    pub fn report(&self, status: ProgressStatus) {
        (self.reporter)(self.id, status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("interrupted")]
    Interrupted,
    /// Setup problems outside the command, attributed to the action.
    #[error("{0}")]
    Environmental(String),
    /// The build can't usefully continue (e.g. the disk is full).
    #[error("catastrophic failure: {0}")]
    Catastrophic(String),
    /// The command ran (or was denied) and did not succeed.
    #[error("{message}")]
    SpawnFailed {
        result: Box<SpawnResult>,
        message: String,
    },
}

impl ExecError {
    pub fn is_catastrophic(&self) -> bool {
        match self {
            ExecError::Catastrophic(_) => true,
            ExecError::SpawnFailed { result, .. } => result.status == Status::Catastrophe,
            _ => false,
        }
    }

    /// Classifies an I/O error met while preparing an execution.
    pub fn from_io(context: impl fmt::Display, err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            ExecError::Catastrophic(format!("{}: {}", context, err))
        } else {
            ExecError::Environmental(format!("{}: {}", context, err))
        }
    }
}

pub trait SpawnRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Executes the spawn.  A command that ran and failed is an Ok result
    /// with a non-success status; Err is for failures around the command.
    fn exec(&self, spawn: &Spawn, ctx: &SpawnContext) -> Result<SpawnResult, ExecError>;
}

/// The outcome of a cache lookup.
pub trait CacheHandle {
    fn has_result(&self) -> bool;
    fn result(&self) -> Option<SpawnResult>;
    /// Whether `store` should be called with the result of executing.
    fn will_store(&self) -> bool;
    fn store(&mut self, result: &SpawnResult) -> Result<(), ExecError>;
}

pub trait SpawnCache: Send + Sync {
    fn lookup(&self, spawn: &Spawn, ctx: &SpawnContext)
        -> Result<Box<dyn CacheHandle + '_>, ExecError>;
}

/// A cache that never hits and never stores.
pub struct NoCache;

struct Miss;

impl CacheHandle for Miss {
    fn has_result(&self) -> bool {
        false
    }
    fn result(&self) -> Option<SpawnResult> {
        None
    }
    fn will_store(&self) -> bool {
        false
    }
    fn store(&mut self, _result: &SpawnResult) -> Result<(), ExecError> {
        Ok(())
    }
}

impl SpawnCache for NoCache {
    fn lookup(&self, _spawn: &Spawn, _ctx: &SpawnContext)
        -> Result<Box<dyn CacheHandle + '_>, ExecError> {
        Ok(Box::new(Miss))
    }
}
