//! Parser for BUILD.kiln manifests.
//!
//! A manifest is a sequence of statements, each a keyword line followed by
//! indented `key = value` lines:
//!
//! ```text
//! target //app:bin
//!   deps = //lib:a
//! action CppLink
//!   in = out/a.o
//!   out = out/bin
//!   command = cc out/a.o -o out/bin
//! default //app:bin
//! ```
//!
//! An `action` belongs to the closest `target` above it.

use crate::graph::{ActionSpec, CommandLine, Label, ParamFile};
use crate::scanner::{ParseResult, Scanner};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A manifest syntax or consistency error, rendered with file:line context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{rendered}")]
pub struct ParseError {
    pub file: PathBuf,
    pub line: usize,
    rendered: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub label: Label,
    pub deps: Vec<Label>,
    pub actions: Vec<ActionSpec>,
    /// Where the target was declared.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Manifest {
    pub targets: BTreeMap<Label, Target>,
    pub defaults: Vec<Label>,
}

impl Manifest {
    pub fn target(&self, label: &Label) -> Option<&Target> {
        self.targets.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.targets.keys()
    }
}

/// One `key = value` line of a block.
struct Attr<'text> {
    key: &'text str,
    value: &'text str,
    ofs: usize,
}

struct Parser<'text> {
    scanner: Scanner<'text>,
    manifest: Manifest,
    /// The target that subsequent actions attach to.
    current: Option<Label>,
}

pub fn parse(file: &Path, text: &str) -> Result<Manifest, ParseError> {
    let mut parser = Parser {
        scanner: Scanner::new(text),
        manifest: Manifest::default(),
        current: None,
    };
    match parser.read_all() {
        Ok(()) => Ok(parser.manifest),
        Err(err) => Err(ParseError {
            file: file.to_path_buf(),
            line: parser.scanner.line_of(err.offset()),
            rendered: parser.scanner.format_parse_error(file, &err),
        }),
    }
}

fn parse_label(scanner: &Scanner, ofs: usize, text: &str) -> ParseResult<Label> {
    match Label::parse(text) {
        Some(label) => Ok(label),
        None => scanner.parse_error_at(ofs, format!("invalid label {:?}", text)),
    }
}

fn parse_number<T: std::str::FromStr>(scanner: &Scanner, attr: &Attr) -> ParseResult<T> {
    match attr.value.parse::<T>() {
        Ok(n) => Ok(n),
        Err(_) => scanner.parse_error_at(
            attr.ofs,
            format!("{}: expected a number, got {:?}", attr.key, attr.value),
        ),
    }
}

impl<'text> Parser<'text> {
    fn read_all(&mut self) -> ParseResult<()> {
        loop {
            match self.scanner.peek() {
                '\0' if self.scanner.at_end() => return Ok(()),
                '\r' | '\n' => {
                    self.scanner.skip_newline();
                }
                '#' => self.skip_line(),
                ' ' | '\t' => {
                    self.scanner.skip_spaces();
                    if !self.at_blank() {
                        return self.scanner.parse_error("unexpected indentation");
                    }
                    self.skip_line();
                }
                _ => self.read_statement()?,
            }
        }
    }

    /// Whether the rest of the line holds nothing but a comment.
    fn at_blank(&self) -> bool {
        self.scanner.at_end() || self.scanner.peek_newline() || self.scanner.peek() == '#'
    }

    fn skip_line(&mut self) {
        self.scanner.read_to_eol();
        self.scanner.skip_newline();
    }

    fn read_statement(&mut self) -> ParseResult<()> {
        let start = self.scanner.ofs;
        let keyword = self.scanner.read_word();
        self.scanner.skip_spaces();
        let arg_ofs = self.scanner.ofs;
        let arg = self.scanner.read_to_eol();
        self.scanner.skip_newline();
        let attrs = self.read_attrs()?;
        match keyword {
            "target" => self.read_target(start, arg_ofs, arg, attrs),
            "action" => self.read_action(start, arg_ofs, arg, attrs),
            "default" => {
                if let Some(attr) = attrs.first() {
                    return self
                        .scanner
                        .parse_error_at(attr.ofs, "default takes no attributes");
                }
                if arg.is_empty() {
                    return self.scanner.parse_error_at(arg_ofs, "expected label");
                }
                for word in arg.split_whitespace() {
                    let label = parse_label(&self.scanner, arg_ofs, word)?;
                    self.manifest.defaults.push(label);
                }
                Ok(())
            }
            _ => self
                .scanner
                .parse_error_at(start, format!("unknown statement {:?}", keyword)),
        }
    }

    fn read_attrs(&mut self) -> ParseResult<Vec<Attr<'text>>> {
        let mut attrs = Vec::new();
        loop {
            match self.scanner.peek() {
                ' ' | '\t' => self.scanner.skip_spaces(),
                '#' => {
                    self.skip_line();
                    continue;
                }
                _ if self.scanner.peek_newline() => {
                    self.scanner.skip_newline();
                    continue;
                }
                _ => break,
            }
            if self.at_blank() {
                self.skip_line();
                continue;
            }
            let ofs = self.scanner.ofs;
            let key = self.scanner.read_word();
            self.scanner.skip_spaces();
            self.scanner.expect('=')?;
            self.scanner.skip_spaces();
            let value = self.scanner.read_to_eol();
            self.scanner.skip_newline();
            attrs.push(Attr { key, value, ofs });
        }
        Ok(attrs)
    }

    fn read_target(
        &mut self,
        start: usize,
        arg_ofs: usize,
        arg: &str,
        attrs: Vec<Attr>,
    ) -> ParseResult<()> {
        let label = parse_label(&self.scanner, arg_ofs, arg)?;
        if self.manifest.targets.contains_key(&label) {
            return self
                .scanner
                .parse_error_at(start, format!("duplicate target {}", label));
        }
        let mut deps = Vec::new();
        for attr in attrs {
            match attr.key {
                "deps" => {
                    for word in attr.value.split_whitespace() {
                        deps.push(parse_label(&self.scanner, attr.ofs, word)?);
                    }
                }
                key => {
                    return self
                        .scanner
                        .parse_error_at(attr.ofs, format!("unknown target attribute {:?}", key))
                }
            }
        }
        let target = Target {
            label: label.clone(),
            deps,
            actions: Vec::new(),
            line: self.scanner.line_of(start),
        };
        self.manifest.targets.insert(label.clone(), target);
        self.current = Some(label);
        Ok(())
    }

    fn read_action(
        &mut self,
        start: usize,
        arg_ofs: usize,
        mnemonic: &str,
        attrs: Vec<Attr>,
    ) -> ParseResult<()> {
        let owner = match &self.current {
            Some(label) => label.clone(),
            None => {
                return self
                    .scanner
                    .parse_error_at(start, "action outside of any target")
            }
        };
        if mnemonic.is_empty() || mnemonic.contains(char::is_whitespace) {
            return self.scanner.parse_error_at(arg_ofs, "expected one mnemonic");
        }

        let mut command: Option<CommandLine> = None;
        let mut spec = ActionSpec::new(mnemonic, CommandLine::Argv(Vec::new()));
        let mut param_path: Option<&str> = None;
        let mut param_content = String::new();
        for attr in &attrs {
            match attr.key {
                "in" => spec
                    .inputs
                    .extend(attr.value.split_whitespace().map(str::to_owned)),
                "out" => spec
                    .outputs
                    .extend(attr.value.split_whitespace().map(str::to_owned)),
                "command" | "argv" => {
                    if command.is_some() {
                        return self
                            .scanner
                            .parse_error_at(attr.ofs, "action has more than one command");
                    }
                    command = Some(if attr.key == "command" {
                        CommandLine::Shell(attr.value.to_owned())
                    } else {
                        CommandLine::Argv(attr.value.split_whitespace().map(str::to_owned).collect())
                    });
                }
                "message" => spec.progress_message = attr.value.to_owned(),
                "env" => {
                    for pair in attr.value.split_whitespace() {
                        match pair.split_once('=') {
                            Some((k, v)) if !k.is_empty() => {
                                spec.env.insert(k.to_owned(), v.to_owned());
                            }
                            _ => {
                                return self.scanner.parse_error_at(
                                    attr.ofs,
                                    format!("env: expected NAME=VALUE, got {:?}", pair),
                                )
                            }
                        }
                    }
                }
                "requires" => spec
                    .requirements
                    .extend(attr.value.split_whitespace().map(str::to_owned)),
                "timeout" => {
                    let secs: u64 = parse_number(&self.scanner, attr)?;
                    spec.timeout = Some(Duration::from_secs(secs));
                }
                "cpu" => spec.resources.cpu = parse_number(&self.scanner, attr)?,
                "memory" => spec.resources.memory_mb = parse_number(&self.scanner, attr)?,
                "test_jobs" => spec.resources.local_test_jobs = parse_number(&self.scanner, attr)?,
                "param_file" => param_path = Some(attr.value),
                "param_content" => {
                    param_content.push_str(attr.value);
                    param_content.push('\n');
                }
                key => {
                    return self
                        .scanner
                        .parse_error_at(attr.ofs, format!("unknown action attribute {:?}", key))
                }
            }
        }

        spec.command = match command {
            Some(command) => command,
            None => return self.scanner.parse_error_at(start, "action has no command"),
        };
        if spec.command.argv().is_empty() {
            return self.scanner.parse_error_at(start, "action has an empty argv");
        }
        if spec.outputs.is_empty() {
            return self.scanner.parse_error_at(start, "action has no outputs");
        }
        match param_path {
            Some(path) => {
                spec.param_file = Some(ParamFile {
                    path: path.to_owned(),
                    content: param_content,
                })
            }
            None if !param_content.is_empty() => {
                return self
                    .scanner
                    .parse_error_at(start, "param_content without param_file")
            }
            None => {}
        }

        // The owner was looked up above, so the target exists.
        if let Some(target) = self.manifest.targets.get_mut(&owner) {
            target.actions.push(spec);
        }
        Ok(())
    }
}

/// Reads and parses a manifest from disk.
pub fn read(path: &Path) -> anyhow::Result<Manifest> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("read {}: {}", path.display(), err))?;
    Ok(parse(path, &text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(text: &str) -> Result<Manifest, ParseError> {
        parse(Path::new("BUILD.kiln"), text)
    }

    fn label(s: &str) -> Label {
        Label::parse(s).unwrap()
    }

    #[test]
    fn full_action() {
        let m = parse_str(
            "# comment
target //lib:a
  deps = //base:b //base:c
action CppCompile
  in = a.c a.h
  out = out/a.o
  command = cc -c a.c -o out/a.o
  message = Compiling a.c
  env = LANG=C FOO=bar=baz
  requires = no-remote local
  timeout = 60
  cpu = 2
  memory = 200.5

  param_file = out/a.params
  param_content = -O2
  param_content = -g
default //lib:a
",
        )
        .unwrap();
        let t = m.target(&label("//lib:a")).unwrap();
        assert_eq!(t.deps, vec![label("//base:b"), label("//base:c")]);
        assert_eq!(t.line, 2);
        assert_eq!(t.actions.len(), 1);
        let a = &t.actions[0];
        assert_eq!(a.mnemonic, "CppCompile");
        assert_eq!(a.inputs, vec!["a.c", "a.h"]);
        assert_eq!(a.outputs, vec!["out/a.o"]);
        assert_eq!(a.command, CommandLine::Shell("cc -c a.c -o out/a.o".into()));
        assert_eq!(a.progress_message, "Compiling a.c");
        assert_eq!(a.env.get("FOO").map(String::as_str), Some("bar=baz"));
        assert!(a.requirements.contains("local"));
        assert_eq!(a.timeout, Some(Duration::from_secs(60)));
        assert_eq!(a.resources.cpu, 2.0);
        assert_eq!(a.resources.memory_mb, 200.5);
        assert_eq!(
            a.param_file,
            Some(ParamFile {
                path: "out/a.params".into(),
                content: "-O2\n-g\n".into()
            })
        );
        assert_eq!(m.defaults, vec![label("//lib:a")]);
    }

    #[test]
    fn actions_attach_to_preceding_target() {
        let m = parse_str(
            "target //p:one
action Gen
  out = one
  argv = touch one
target //p:two
action Gen
  out = two
  command = touch two
action Gen
  out = three
  command = touch three
",
        )
        .unwrap();
        assert_eq!(m.target(&label("//p:one")).unwrap().actions.len(), 1);
        assert_eq!(m.target(&label("//p:two")).unwrap().actions.len(), 2);
        assert_eq!(
            m.target(&label("//p:one")).unwrap().actions[0].command,
            CommandLine::Argv(vec!["touch".into(), "one".into()])
        );
    }

    #[test]
    fn errors_carry_location() {
        let err = parse_str("target //p:a\naction Gen\n  out = x\n  command = true\n  colour = red\n")
            .unwrap_err();
        assert_eq!(err.line, 5);
        let msg = err.to_string();
        assert!(msg.contains("unknown action attribute \"colour\""), "{}", msg);
        assert!(msg.contains("BUILD.kiln:5:"), "{}", msg);
    }

    #[test]
    fn rejects_malformed_input() {
        let cases = [
            ("action Gen\n  out = x\n  command = true\n", "outside of any target"),
            ("target p:a\n", "invalid label"),
            ("target //p:a\ntarget //p:a\n", "duplicate target"),
            ("target //p:a\naction Gen\n  command = true\n", "no outputs"),
            ("target //p:a\naction Gen\n  out = x\n", "no command"),
            ("target //p:a\naction Gen\n  out = x\n  command = true\n  timeout = soon\n", "expected a number"),
            ("  target //p:a\n", "unexpected indentation"),
            ("rule cc\n", "unknown statement"),
        ];
        for (text, want) in cases {
            let err = parse_str(text).unwrap_err().to_string();
            assert!(err.contains(want), "{:?}: {}", text, err);
        }
    }
}
