//! Runs spawns as local subprocesses.
//!
//! Each command gets its own process group, so that on timeout or
//! cancellation the whole tree it started can be signalled, and a clean
//! environment plus a private TMPDIR that is removed afterwards.

use crate::resources::ResourceManager;
use crate::spawn::{
    ExecError, OutputCapture, ProgressStatus, Spawn, SpawnContext, SpawnResult, SpawnRunner,
    Status, LOCAL_EXEC_ERROR, POSIX_TIMEOUT_EXIT_CODE,
};
use crate::signal::Interrupt;
use std::collections::BTreeSet;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

const NAME: &str = "local";

/// How often a running command is checked for exit, timeout or interruption.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long pipes may stay open after the group was killed.
const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct LocalExecutionOptions {
    /// Mnemonics allowed to run locally; None allows everything.
    pub allowed_mnemonics: Option<BTreeSet<String>>,
    /// Time between the polite SIGINT and the SIGKILL on timeout.
    pub kill_grace: Duration,
    /// Applies to spawns that don't carry their own timeout.
    pub default_timeout: Option<Duration>,
}

impl Default for LocalExecutionOptions {
    fn default() -> Self {
        LocalExecutionOptions {
            allowed_mnemonics: None,
            kill_grace: Duration::from_secs(15),
            default_timeout: None,
        }
    }
}

pub struct LocalSpawnRunner {
    resources: Arc<ResourceManager>,
    options: LocalExecutionOptions,
}

/// A reaped child.
struct Exit {
    status: ExitStatus,
    user_time: Duration,
    system_time: Duration,
}

enum Outcome {
    Exited(Exit),
    TimedOut(Exit),
    Interrupted,
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

/// Reaps `pid` via wait4(), which also yields the child's own resource usage.
/// With `nohang`, returns None while the child is still running.
fn reap(pid: libc::pid_t, nohang: bool) -> io::Result<Option<Exit>> {
    let options = if nohang { libc::WNOHANG } else { 0 };
    loop {
        let mut status: libc::c_int = 0;
        // Safety: plain libc call with pointers to locals.
        let (ret, usage) = unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            let ret = libc::wait4(pid, &mut status, options, &mut usage);
            (ret, usage)
        };
        if ret == 0 {
            return Ok(None);
        }
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(Some(Exit {
            status: ExitStatus::from_raw(status),
            user_time: timeval_duration(usage.ru_utime),
            system_time: timeval_duration(usage.ru_stime),
        }));
    }
}

fn signal_group(pid: libc::pid_t, sig: libc::c_int) {
    // Safety: signalling a process group we created.  Failure means the group
    // is already gone, which is what we wanted.
    unsafe {
        libc::kill(-pid, sig);
    }
}

fn read_all<R: Read>(pipe: Option<R>, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        // Whatever was read before the error is kept.
        if let Err(err) = pipe.read_to_end(&mut buf) {
            log::warn!("reading {}: {} (kept {} bytes)", name, err, buf.len());
        }
    }
    buf
}

/// Drains a pipe on a thread of its own.  The thread isn't joined: a
/// process outside our group may keep the pipe open indefinitely.
fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    name: &'static str,
) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(read_all(pipe, name));
    });
    rx
}

/// The output of a reader, or None if its pipe was still open at `deadline`.
fn collect(reader: &mpsc::Receiver<Vec<u8>>, deadline: Option<Instant>) -> Option<Vec<u8>> {
    let received = match deadline {
        None => reader.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        Some(deadline) => {
            reader.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        }
    };
    match received {
        Ok(buf) => Some(buf),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => Some(Vec::new()),
    }
}

/// Maps a normal process exit to a status and exit code.  A process killed by
/// signal s reports 128+s, as a shell would.
fn exit_status(status: ExitStatus) -> (Status, i32) {
    match status.code() {
        Some(0) => (Status::Success, 0),
        Some(code) => (Status::NonZeroExit, code),
        None => (
            Status::NonZeroExit,
            128 + status.signal().unwrap_or(0),
        ),
    }
}

impl LocalSpawnRunner {
    pub fn new(resources: Arc<ResourceManager>, options: LocalExecutionOptions) -> Self {
        LocalSpawnRunner { resources, options }
    }

    fn allowed(&self, mnemonic: &str) -> bool {
        match &self.options.allowed_mnemonics {
            None => true,
            Some(allowed) => allowed.contains(mnemonic),
        }
    }

    /// Verifies every input is present before paying for a process start.
    fn prefetch_inputs(&self, spawn: &Spawn, exec_root: &Path) -> Result<(), ExecError> {
        for (path, _) in &spawn.inputs {
            if !exec_root.join(path).exists() {
                return Err(ExecError::Environmental(format!(
                    "{}: missing input file '{}'",
                    spawn.owner, path
                )));
            }
        }
        Ok(())
    }

    fn prepare_files(&self, spawn: &Spawn, exec_root: &Path) -> Result<(), ExecError> {
        for pf in &spawn.param_files {
            let path = exec_root.join(&pf.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| ExecError::from_io(parent.display(), err))?;
            }
            std::fs::write(&path, &pf.content)
                .map_err(|err| ExecError::from_io(path.display(), err))?;
        }
        for out in &spawn.outputs {
            if let Some(parent) = exec_root.join(out).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| ExecError::from_io(parent.display(), err))?;
            }
        }
        Ok(())
    }

    /// Waits for the command, enforcing the timeout and reacting to
    /// interruption.
    fn wait(
        &self,
        pid: libc::pid_t,
        timeout: Option<Duration>,
        interrupt: &Interrupt,
    ) -> io::Result<Outcome> {
        let start = Instant::now();
        loop {
            if let Some(exit) = reap(pid, true)? {
                return Ok(Outcome::Exited(exit));
            }
            if interrupt.is_set() {
                signal_group(pid, libc::SIGKILL);
                reap(pid, false)?;
                return Ok(Outcome::Interrupted);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return self.terminate(pid).map(Outcome::TimedOut);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGINT the group, give it the grace period to exit, then SIGKILL.
    fn terminate(&self, pid: libc::pid_t) -> io::Result<Exit> {
        signal_group(pid, libc::SIGINT);
        let deadline = Instant::now() + self.options.kill_grace;
        while Instant::now() < deadline {
            if let Some(exit) = reap(pid, true)? {
                // The leader is gone; make sure nothing it started lingers.
                signal_group(pid, libc::SIGKILL);
                return Ok(exit);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        log::warn!("process group {} ignored SIGINT; sending SIGKILL", pid);
        signal_group(pid, libc::SIGKILL);
        match reap(pid, false)? {
            Some(exit) => Ok(exit),
            None => Err(io::Error::new(io::ErrorKind::Other, "wait4 returned no child")),
        }
    }

    fn run_command(
        &self,
        spawn: &Spawn,
        ctx: &SpawnContext,
        tmpdir: &Path,
    ) -> Result<SpawnResult, ExecError> {
        let (program, args) = match spawn.argv.split_first() {
            Some(split) => split,
            None => {
                return Ok(SpawnResult::new(NAME, Status::ExecutionFailed, LOCAL_EXEC_ERROR)
                    .with_message("empty command line"))
            }
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(ctx.exec_root)
            .env_clear()
            .envs(&spawn.env)
            .env("TMPDIR", tmpdir)
            .stdin(Stdio::null())
            .process_group(0);
        match &ctx.output {
            OutputCapture::InMemory => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputCapture::Files { stdout, stderr } => {
                for path in [stdout, stderr] {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|err| ExecError::from_io(parent.display(), err))?;
                    }
                }
                let out = std::fs::File::create(stdout)
                    .map_err(|err| ExecError::from_io(stdout.display(), err))?;
                let err = std::fs::File::create(stderr)
                    .map_err(|err| ExecError::from_io(stderr.display(), err))?;
                cmd.stdout(out).stderr(err);
            }
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                log::debug!("{}: failed to start {}: {}", spawn.owner, program, err);
                return Ok(SpawnResult::new(NAME, Status::ExecutionFailed, LOCAL_EXEC_ERROR)
                    .with_message(format!("{}: {}", program, err)));
            }
        };
        let pid = child.id() as libc::pid_t;
        let timeout = spawn.timeout.or(self.options.default_timeout);
        let stdout = spawn_reader(child.stdout.take(), "stdout");
        let stderr = spawn_reader(child.stderr.take(), "stderr");

        let outcome = self.wait(pid, timeout, ctx.interrupt);
        // Nothing the command started outlives it.
        signal_group(pid, libc::SIGKILL);
        let outcome = outcome.map_err(|err| {
            ExecError::Environmental(format!("{}: waiting for {}: {}", spawn.owner, pid, err))
        })?;

        if let Outcome::Interrupted = outcome {
            return Err(ExecError::Interrupted);
        }
        // A process that left the group can hold the pipes open past the
        // leader's exit; the timeout bounds that wait too.
        let deadline = timeout.map(|timeout| (start + timeout).max(Instant::now()) + PIPE_GRACE);
        let stdout = collect(&stdout, deadline);
        let stderr = collect(&stderr, deadline);
        let outcome = match outcome {
            Outcome::Exited(exit) if stdout.is_none() || stderr.is_none() => {
                log::warn!("{}: output still open at the timeout", spawn.owner);
                Outcome::TimedOut(exit)
            }
            other => other,
        };
        let mut result = match outcome {
            Outcome::Interrupted => return Err(ExecError::Interrupted),
            Outcome::Exited(exit) => {
                let (status, code) = exit_status(exit.status);
                let mut result = SpawnResult::new(NAME, status, code);
                result.user_time = Some(exit.user_time);
                result.system_time = Some(exit.system_time);
                result
            }
            Outcome::TimedOut(exit) => {
                let mut result = SpawnResult::new(NAME, Status::Timeout, POSIX_TIMEOUT_EXIT_CODE)
                    .with_message(format!(
                        "timed out after {:.1}s",
                        timeout.unwrap_or_default().as_secs_f64()
                    ));
                result.user_time = Some(exit.user_time);
                result.system_time = Some(exit.system_time);
                result
            }
        };
        result.wall_time = start.elapsed();
        result.stdout = stdout.unwrap_or_default();
        result.stderr = stderr.unwrap_or_default();
        Ok(result)
    }
}

impl SpawnRunner for LocalSpawnRunner {
    fn name(&self) -> &str {
        NAME
    }

    fn exec(&self, spawn: &Spawn, ctx: &SpawnContext) -> Result<SpawnResult, ExecError> {
        ctx.report(ProgressStatus::Scheduling);
        let _resources = self
            .resources
            .acquire(&spawn.owner, &spawn.resources, ctx.interrupt)?;
        ctx.report(ProgressStatus::Executing);

        if !self.allowed(&spawn.mnemonic) {
            return Ok(
                SpawnResult::new(NAME, Status::ExecutionDenied, LOCAL_EXEC_ERROR).with_message(
                    format!("{} is not allowed to run locally", spawn.mnemonic),
                ),
            );
        }
        log::debug!("{}: running {:?}", spawn.owner, spawn.argv);
        self.prefetch_inputs(spawn, ctx.exec_root)?;
        self.prepare_files(spawn, ctx.exec_root)?;

        let tmp = tempfile::Builder::new()
            .prefix("local-spawn-runner.")
            .tempdir()
            .map_err(|err| ExecError::from_io("creating temp dir", err))?;
        let result = self.run_command(spawn, ctx, tmp.path());
        let tmp_path = tmp.path().to_path_buf();
        if let Err(err) = tmp.close() {
            log::warn!("failed to delete {}: {}", tmp_path.display(), err);
        }
        result
    }
}
