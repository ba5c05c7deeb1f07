use crate::e2e::*;

#[test]
fn explain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    space.write("in", "x")?;
    let out = space.run_expect(&mut kiln_command(vec!["--explain", "//:copy"]))?;
    assert_output_contains(&out, "explain: Copying in: no entry in the action cache");

    space.write("in", "changed")?;
    let out = space.run_expect(&mut kiln_command(vec!["--explain", "//:copy"]))?;
    assert_output_contains(&out, "explain: Copying in: input 'in' changed");
    Ok(())
}

#[test]
fn output_to_files() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "BUILD.kiln",
        "
target //:t
action Talk
  out = out/t
  command = echo to stdout; touch out/t
",
    )?;
    space.run_expect(&mut kiln_command(vec!["--output-to-files", "//:t"]))?;
    assert_eq!(space.read(".kiln/outputs/0.stdout")?, b"to stdout\n");
    Ok(())
}

#[test]
fn allow_local_denies_other_mnemonics() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    space.write("in", "x")?;
    let out = space.run(&mut kiln_command(vec!["--allow-local", "Javac", "//:copy"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "execution denied");

    space.run_expect(&mut kiln_command(vec!["--allow-local", "Copy", "//:copy"]))?;
    Ok(())
}

#[test]
fn disk_cache_is_shared() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let cache_dir = cache.path().to_str().unwrap();
    let manifest = "
target //:t
action Stamp
  in = in
  out = out/t
  command = cat in > out/t; echo ran > ran.log
";
    let first = TestSpace::new()?;
    let second = TestSpace::new()?;
    for space in [&first, &second] {
        space.write("BUILD.kiln", manifest)?;
        space.write("in", "same")?;
        space.run_expect(&mut kiln_command(vec!["--disk-cache", cache_dir, "//:t"]))?;
        assert_eq!(space.read("out/t")?, b"same");
    }
    assert!(first.exists("ran.log"));
    // The second workspace got its output from the cache.
    assert!(!second.exists("ran.log"));
    Ok(())
}

#[test]
fn trace_debug_tool() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("BUILD.kiln", COPY_TARGET)?;
    space.write("in", "x")?;
    space.run_expect(&mut kiln_command(vec!["-d", "trace", "//:copy"]))?;
    let trace = String::from_utf8(space.read("trace.json")?)?;
    assert!(trace.contains("\"name\": \"execution\""), "{}", trace);
    assert!(trace.contains("Copying in"), "{}", trace);
    Ok(())
}
