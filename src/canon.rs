//! Artifact path canonicalization.
//!
//! Every artifact is identified by its execution-root-relative path, so two
//! spellings of the same file ("out/./a.o", "out//a.o") must intern to the same
//! artifact.  This is purely lexical and never touches the disk.

/// Lexically canonicalize a path, removing redundant components.
/// "foo/./bar" => "foo/bar", "foo/../bar" => "bar", "foo//bar" => "foo/bar".
/// Leading ".." components that cannot be popped are preserved, as is a
/// leading '/'.  Trailing separators are dropped.  An empty result is ".".
pub fn canon_path<T: AsRef<str>>(path: T) -> String {
    let path = path.as_ref();
    let absolute = path.starts_with('/');

    let mut components: Vec<&str> = Vec::new();
    // Count of leading ".." components that could not be popped.
    let mut parents = 0;
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() && !absolute {
                    parents += 1;
                }
            }
            c => components.push(c),
        }
    }

    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for _ in 0..parents {
        out.push_str("../");
    }
    out.push_str(&components.join("/"));
    if out.ends_with('/') && out.len() > 1 {
        out.pop();
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Whether a canonical path stays inside the execution root.
pub fn is_exec_relative(canon: &str) -> bool {
    !(canon.starts_with('/') || canon == ".." || canon.starts_with("../") || canon == ".")
}
