//! Library-level builds of a small workspace through a Session.

use kiln::graph::{Action, ActionId, Label};
use kiln::progress::Progress;
use kiln::session::{BuildRequest, BuildResult, ModifiedFileSet, Session, SessionOptions};
use kiln::signal::Interrupt;
use kiln::work::{ActionOutcome, ActionState, BuildOptions, StateCounts};
use std::collections::BTreeSet;
use std::path::Path;

/// Progress that records how each action finished.
#[derive(Default)]
struct Recorder {
    finished: Vec<(String, ActionState)>,
}

impl Progress for Recorder {
    fn update(&mut self, _counts: &StateCounts) {}
    fn action_state(&mut self, _id: ActionId, _action: &Action, _state: ActionState) {}
    fn action_finished(&mut self, _id: ActionId, action: &Action, outcome: &ActionOutcome) {
        self.finished.push((action.mnemonic.clone(), outcome.state));
    }
    fn log(&mut self, _msg: &str) {}
}

const MANIFEST: &str = "
target //:a
action Cc
  in = a.c
  out = out/a.o
  command = head -c 3 a.c > out/a.o

target //:bin
  deps = //:a
action Link
  in = out/a.o
  out = out/bin
  command = cat out/a.o out/a.o > out/bin

target //:c
action Gen
  in = c.txt
  out = out/c
  command = cat c.txt > out/c

default //:bin //:c
";

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> anyhow::Result<Self> {
        let ws = Workspace {
            dir: tempfile::tempdir()?,
        };
        ws.write("BUILD.kiln", MANIFEST)?;
        ws.write("a.c", "int main")?;
        ws.write("c.txt", "hello")?;
        Ok(ws)
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.root().join(path), content)
    }

    fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.root().join(path))
    }

    fn session(&self) -> anyhow::Result<Session> {
        Session::new(SessionOptions::new(self.root()))
    }
}

fn modified(paths: &[&str]) -> ModifiedFileSet {
    ModifiedFileSet::Paths(paths.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>())
}

fn build(
    session: &mut Session,
    targets: &[&str],
    keep_going: bool,
) -> anyhow::Result<(BuildResult, Vec<(String, ActionState)>)> {
    let request = BuildRequest {
        targets: targets.iter().map(|t| Label::parse(t).unwrap()).collect(),
        options: BuildOptions {
            jobs: 2,
            keep_going,
            ..BuildOptions::default()
        },
    };
    let mut recorder = Recorder::default();
    let result = session.build(&request, &mut recorder, &Interrupt::new())?;
    let mut finished = recorder.finished;
    finished.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((result, finished))
}

fn states(list: &[(&str, ActionState)]) -> Vec<(String, ActionState)> {
    list.iter().map(|(m, s)| (m.to_string(), *s)).collect()
}

#[test]
fn incremental_builds() -> anyhow::Result<()> {
    use ActionState::*;
    let ws = Workspace::new()?;
    let mut session = ws.session()?;

    // First build runs everything.
    let (result, finished) = build(&mut session, &[], false)?;
    assert!(result.success(), "{:?}", result);
    assert_eq!(
        finished,
        states(&[("Cc", Succeeded), ("Gen", Succeeded), ("Link", Succeeded)])
    );
    assert_eq!(result.report_line(), "2 of 2 targets built");
    assert_eq!(ws.read("out/bin")?, "intint");
    assert_eq!(ws.read("out/c")?, "hello");

    // Nothing changed: nothing runs.
    session.invalidate(modified(&[]));
    let (result, finished) = build(&mut session, &[], false)?;
    assert!(result.success());
    assert_eq!(result.summary.executed, 0);
    assert_eq!(
        finished,
        states(&[("Cc", UpToDate), ("Gen", UpToDate), ("Link", UpToDate)])
    );

    // Editing a.c reruns its compile; the object comes out the same, so the
    // link stays up to date.
    ws.write("a.c", "int main() {}")?;
    session.invalidate(modified(&["a.c"]));
    let (result, finished) = build(&mut session, &[], false)?;
    assert!(result.success());
    assert_eq!(
        finished,
        states(&[("Cc", Succeeded), ("Gen", UpToDate), ("Link", UpToDate)])
    );

    // A real change propagates.
    ws.write("a.c", "long x;")?;
    session.invalidate(modified(&["a.c"]));
    let (_, finished) = build(&mut session, &[], false)?;
    assert_eq!(
        finished,
        states(&[("Cc", Succeeded), ("Gen", UpToDate), ("Link", Succeeded)])
    );
    assert_eq!(ws.read("out/bin")?, "lonlon");
    Ok(())
}

#[test]
fn only_requested_targets_run() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let mut session = ws.session()?;
    let (result, finished) = build(&mut session, &["//:c"], false)?;
    assert!(result.success());
    assert_eq!(finished, states(&[("Gen", ActionState::Succeeded)]));
    assert!(!ws.root().join("out/bin").exists());
    Ok(())
}

#[test]
fn deleted_output_is_rebuilt() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let mut session = ws.session()?;
    build(&mut session, &["//:bin"], false)?;

    std::fs::remove_file(ws.root().join("out/bin"))?;
    session.invalidate(modified(&[]));
    let (_, finished) = build(&mut session, &["//:bin"], false)?;
    assert_eq!(
        finished,
        states(&[("Cc", ActionState::UpToDate), ("Link", ActionState::Succeeded)])
    );
    assert_eq!(ws.read("out/bin")?, "intint");
    Ok(())
}

#[test]
fn action_cache_survives_the_session() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    {
        let mut session = ws.session()?;
        build(&mut session, &[], false)?;
        assert_eq!(session.action_cache().len(), 3);
    }
    assert!(ws.root().join(".kiln/action_cache").exists());

    let mut session = ws.session()?;
    let (result, _) = build(&mut session, &[], false)?;
    assert!(result.success());
    assert_eq!(result.summary.executed, 0);
    assert_eq!(result.summary.up_to_date, 3);
    Ok(())
}

#[test]
fn command_change_reruns() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let mut session = ws.session()?;
    build(&mut session, &["//:c"], false)?;

    ws.write(
        "BUILD.kiln",
        &MANIFEST.replace("cat c.txt > out/c", "cat c.txt c.txt > out/c"),
    )?;
    session.invalidate(modified(&["BUILD.kiln"]));
    let (_, finished) = build(&mut session, &["//:c"], false)?;
    assert_eq!(finished, states(&[("Gen", ActionState::Succeeded)]));
    assert_eq!(ws.read("out/c")?, "hellohello");
    Ok(())
}

#[test]
fn failures_and_keep_going() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    ws.write(
        "BUILD.kiln",
        &MANIFEST.replace("head -c 3 a.c > out/a.o", "exit 3"),
    )?;
    let mut session = ws.session()?;

    let (result, finished) = build(&mut session, &["//:bin", "//:c"], true)?;
    assert!(!result.success());
    assert_eq!(result.report_line(), "1 of 2 targets built");
    assert_eq!(
        finished,
        states(&[
            ("Cc", ActionState::NonZeroExit),
            ("Gen", ActionState::Succeeded),
        ])
    );
    assert_eq!(result.summary.counts.get(ActionState::Skipped), 1);
    assert_eq!(result.summary.failures.len(), 1);
    Ok(())
}

#[test]
fn missing_source_fails_the_action() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    std::fs::remove_file(ws.root().join("c.txt"))?;
    let mut session = ws.session()?;
    let (result, finished) = build(&mut session, &["//:c"], false)?;
    assert!(!result.success());
    assert_eq!(finished, states(&[("Gen", ActionState::ExecutionFailed)]));
    assert!(result.summary.failures[0].contains("c.txt"), "{:?}", result.summary.failures);
    Ok(())
}

#[test]
fn analysis_failures() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let mut session = ws.session()?;

    let err = build(&mut session, &["//:nope"], false).unwrap_err();
    assert!(err.to_string().contains("no target //:nope"), "{}", err);

    let (result, finished) = build(&mut session, &["//:nope", "//:c"], true)?;
    assert!(!result.success());
    assert_eq!(result.analysis_failures.len(), 1);
    assert_eq!(result.report_line(), "1 of 2 targets built");
    assert_eq!(finished, states(&[("Gen", ActionState::Succeeded)]));
    Ok(())
}

#[test]
fn conflicting_outputs_are_rejected() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    ws.write(
        "BUILD.kiln",
        "target //:x\naction A\n  out = out/same\n  command = true\n\
         target //:y\naction B\n  out = out/same\n  command = true\n",
    )?;
    let mut session = ws.session()?;
    let err = build(&mut session, &["//:x", "//:y"], false).unwrap_err();
    assert!(err.to_string().contains("out/same"), "{}", err);
    Ok(())
}
