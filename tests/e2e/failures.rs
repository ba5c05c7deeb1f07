use crate::e2e::*;

#[test]
fn failing_action() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "
target //:bad
action Fail
  out = out/bad
  command = echo oops; exit 2
",
    )?;
    let out = space.run(&mut kiln_command(vec!["//:bad"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "FAILED: Fail //:bad failed: exit 2");
    assert_output_contains(&out, "oops");
    assert_output_contains(&out, "target //:bad failed to build");
    assert_output_contains(&out, "0 of 1 targets built");
    Ok(())
}

#[test]
fn keep_going_builds_the_rest() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        &format!(
            "{}
target //:bad
action Fail
  out = out/bad
  command = exit 1
",
            COPY_TARGET
        ),
    )?;
    space.write("in", "x")?;
    let out = space.run(&mut kiln_command(vec!["-k", "-j", "1", "//:bad", "//:copy"]))?;
    assert_eq!(out.status.code(), Some(1));
    assert_output_contains(&out, "1 of 2 targets built");
    assert_output_contains(&out, "target //:copy built");
    assert_output_contains(&out, "target //:bad failed to build");
    assert!(space.exists("out/copy"));
    Ok(())
}

#[test]
fn missing_output_fails() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "
target //:t
action Forget
  out = out/never
  command = true
",
    )?;
    let out = space.run(&mut kiln_command(vec!["//:t"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "output 'out/never' was not created");
    Ok(())
}

#[test]
fn manifest_errors_have_locations() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", "target //:t\n  colour = blue\n")?;
    let out = space.run(&mut kiln_command(vec!["//:t"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "BUILD.kiln:2:");
    Ok(())
}

#[test]
fn invalid_label() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    let out = space.run(&mut kiln_command(vec!["copy"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "invalid target \"copy\"");
    Ok(())
}

#[test]
fn dependency_cycle() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "target //:a\n  deps = //:b\ntarget //:b\n  deps = //:a\n",
    )?;
    let out = space.run(&mut kiln_command(vec!["//:a"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "cycle detected");
    Ok(())
}

#[test]
fn timeout_kills_the_action() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "
target //:slow
action Sleep
  out = out/slow
  timeout = 1
  command = sleep 30
",
    )?;
    let start = std::time::Instant::now();
    let out = space.run(&mut kiln_command(vec!["--sigkill-grace-secs", "1", "//:slow"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "timed out");
    assert!(start.elapsed() < std::time::Duration::from_secs(20));
    Ok(())
}
