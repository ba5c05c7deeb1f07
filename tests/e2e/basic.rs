use crate::e2e::*;

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    space.write("in", "contents")?;
    let out = space.run_expect(&mut kiln_command(vec!["//:copy"]))?;
    assert_output_contains(&out, "Copying in");
    assert_output_contains(&out, "1 of 1 targets built");
    assert_eq!(space.read("out/copy")?, b"contents");
    Ok(())
}

#[test]
fn rebuild_is_a_no_op() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    space.write("in", "contents")?;
    space.run_expect(&mut kiln_command(vec!["//:copy"]))?;

    let out = space.run_expect(&mut kiln_command(vec!["//:copy"]))?;
    assert_output_not_contains(&out, "Copying in");
    assert_output_contains(&out, "0 executed, 1 up to date");

    space.write("in", "new contents")?;
    let out = space.run_expect(&mut kiln_command(vec!["//:copy"]))?;
    assert_output_contains(&out, "Copying in");
    assert_eq!(space.read("out/copy")?, b"new contents");
    Ok(())
}

#[test]
fn default_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", &format!("{}\ndefault //:copy\n", COPY_TARGET))?;
    space.write("in", "x")?;
    space.run_expect(&mut kiln_command(vec![]))?;
    assert!(space.exists("out/copy"));
    Ok(())
}

#[test]
fn no_default_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    let out = space.run(&mut kiln_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "no targets requested");
    Ok(())
}

#[test]
fn targets_across_packages() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "lib/BUILD.kiln",
        "
target //lib:gen
action Gen
  out = out/lib/gen.txt
  command = echo generated > out/lib/gen.txt
",
    )?;
    space.write(
        "app/BUILD.kiln",
        "
target //app:app
  deps = //lib:gen
action Wrap
  in = out/lib/gen.txt
  out = out/app/app.txt
  command = (echo begin; cat out/lib/gen.txt) > out/app/app.txt
",
    )?;
    space.run_expect(&mut kiln_command(vec!["//app:app"]))?;
    assert_eq!(space.read("out/app/app.txt")?, b"begin\ngenerated\n");
    Ok(())
}

#[test]
fn action_env_and_param_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "
target //:t
action Gen
  out = out/t.txt
  env = GREETING=hello
  param_file = out/t.params
  param_content = one
  param_content = two
  command = echo $GREETING > out/t.txt; cat out/t.params >> out/t.txt
",
    )?;
    space.run_expect(&mut kiln_command(vec!["//:t"]))?;
    assert_eq!(space.read("out/t.txt")?, b"hello\none\ntwo\n");
    Ok(())
}

#[test]
fn chdir() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("sub/BUILD.kiln", COPY_TARGET)?;
    space.write("sub/in", "x")?;
    space.run_expect(&mut kiln_command(vec!["-C", "sub", "//:copy"]))?;
    assert!(space.exists("sub/out/copy"));
    Ok(())
}

#[test]
fn argv_command() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "
target //:t
action Copy
  in = in
  out = out/t
  argv = cp in out/t
",
    )?;
    space.write("in", "argv")?;
    space.run_expect(&mut kiln_command(vec!["//:t"]))?;
    assert_eq!(space.read("out/t")?, b"argv");
    Ok(())
}
