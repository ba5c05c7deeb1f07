use crate::graph::Label;
use crate::local::LocalExecutionOptions;
use crate::progress::{DumbConsoleProgress, FancyConsoleProgress, Progress};
use crate::resources::ResourceSet;
use crate::session::{BuildRequest, Session, SessionOptions};
use crate::signal::{self, Interrupt};
use crate::work::BuildOptions;
use crate::{terminal, trace};
use anyhow::anyhow;
use argh::FromArgs;
use std::path::Path;
use std::time::Duration;

/// kiln, an incremental build executor
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// manifest file name in each package [default=BUILD.kiln]
    #[argh(option, short = 'f')]
    manifest: Option<String>,

    /// actions run in parallel [default from system]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// keep building after an action fails
    #[argh(switch, short = 'k')]
    keep_going: bool,

    /// cpus available to local actions
    #[argh(option)]
    local_cpu: Option<f64>,

    /// memory in MB available to local actions
    #[argh(option)]
    local_ram_mb: Option<f64>,

    /// local test jobs at once
    #[argh(option)]
    local_test_jobs: Option<f64>,

    /// seconds between interrupting a timed out action and killing it
    #[argh(option, default = "15")]
    sigkill_grace_secs: u64,

    /// timeout for actions that don't set one
    #[argh(option)]
    timeout_secs: Option<u64>,

    /// directory of a spawn cache shared between workspaces
    #[argh(option)]
    disk_cache: Option<String>,

    /// print why each executed action was out of date
    #[argh(switch)]
    explain: bool,

    /// mnemonic allowed to run locally; repeatable, default allows all
    #[argh(option)]
    allow_local: Vec<String>,

    /// write action output to files under .kiln/outputs
    #[argh(switch)]
    output_to_files: bool,

    /// print executed command lines and debug logging
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools, "-d list" to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// targets to build [default from the root manifest]
    #[argh(positional)]
    targets: Vec<String>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn session_options(args: &Args, exec_root: &Path) -> SessionOptions {
    let mut options = SessionOptions::new(exec_root);
    if let Some(name) = &args.manifest {
        options.manifest_name = name.clone();
    }
    options.disk_cache = args.disk_cache.as_ref().map(|d| exec_root.join(d));

    let machine = ResourceSet::local_machine();
    options.resources = ResourceSet::new(
        args.local_ram_mb.unwrap_or(machine.memory_mb),
        args.local_cpu.unwrap_or(machine.cpu),
        args.local_test_jobs.unwrap_or(machine.local_test_jobs),
    );
    options.local = LocalExecutionOptions {
        allowed_mnemonics: if args.allow_local.is_empty() {
            None
        } else {
            Some(args.allow_local.iter().cloned().collect())
        },
        kill_grace: Duration::from_secs(args.sigkill_grace_secs),
        default_timeout: args.timeout_secs.map(Duration::from_secs),
    };
    options
}

fn build_options(args: &Args, exec_root: &Path) -> BuildOptions {
    let mut options = BuildOptions {
        keep_going: args.keep_going,
        explain: args.explain,
        ..BuildOptions::default()
    };
    if let Some(jobs) = args.jobs {
        options.jobs = jobs;
    }
    if args.output_to_files {
        options.output_dir = Some(exec_root.join(".kiln").join("outputs"));
    }
    options
}

fn run_impl() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    init_logging(args.verbose);

    if let Some(debug) = &args.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => anyhow::bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    let exec_root = std::env::current_dir()?;

    let mut targets = Vec::with_capacity(args.targets.len());
    for name in &args.targets {
        match Label::parse(name) {
            Some(label) => targets.push(label),
            None => anyhow::bail!("invalid target {:?}, expected //package:name", name),
        }
    }

    signal::register_sigint();
    let interrupt = Interrupt::with_sigint();

    let mut session = Session::new(session_options(&args, &exec_root))?;
    let request = BuildRequest {
        targets,
        options: build_options(&args, &exec_root),
    };

    let mut progress: Box<dyn Progress> = if terminal::use_fancy() {
        Box::new(FancyConsoleProgress::new(args.verbose))
    } else {
        Box::new(DumbConsoleProgress::new(args.verbose))
    };
    let result = session.build(&request, progress.as_mut(), &interrupt);
    // Clears the fancy display before the summary lines.
    drop(progress);
    let result = result?;

    for (label, msg) in &result.analysis_failures {
        println!("ERROR: analysis of {} failed: {}", label, msg);
    }
    if let Some(msg) = &result.summary.catastrophe {
        println!("ERROR: build aborted: {}", msg);
    }
    for (label, built) in &result.summary.targets {
        if *built {
            println!("target {} built", label);
        } else {
            println!("target {} failed to build", label);
        }
    }
    if result.summary.interrupted {
        println!("kiln: interrupted");
    }
    println!(
        "kiln: {} ({} executed, {} up to date)",
        result.report_line(),
        result.summary.executed,
        result.summary.up_to_date
    );

    Ok(if result.success() { 0 } else { 1 })
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    if let Err(err) = trace::close() {
        log::warn!("writing trace: {}", err);
    }
    res
}
