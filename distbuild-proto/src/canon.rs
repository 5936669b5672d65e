//! Canonicalizes an upstream compiler invocation into a deterministic
//! `Command`, and classifies it so the Emitter knows whether it is even
//! eligible for caching or remote dispatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a `Command` should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// `-c` with at most one input: cacheable, eligible for remote dispatch.
    Compile,
    /// No `-c`, has inputs: runs locally, never cached or dispatched.
    Link,
    /// Neither of the above: bypass canonicalization entirely.
    Unknown,
}

/// Semantic flag buckets a canonicalized command is sorted into.
///
/// Ordering within `include_dirs` and `defines` is preserved because it's
/// semantically significant (`-I` search order, last-definition-wins for
/// `-D`); everything else is sorted for determinism.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagBuckets {
    pub include_dirs: Vec<String>,
    pub defines: Vec<String>,
    pub language_standard: Option<String>,
    pub optimization: Option<String>,
    pub debug: Vec<String>,
    pub target_triple: Option<String>,
    pub codegen: Vec<String>,
    pub other: Vec<String>,
}

/// An immutable, canonicalized compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    pub executable: String,
    pub cwd: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub inputs: Vec<String>,
    pub output: Option<String>,
    pub language: Option<String>,
    pub flags: FlagBuckets,
}

/// Flags that only affect diagnostics, not codegen, and so are dropped from
/// the cache-key projection (but kept in `args` for the actual spawn).
const CACHE_IRRELEVANT_PREFIXES: &[&str] = &["-W", "-pedantic", "-f-diagnostics"];

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("empty argument vector")]
    EmptyArgv,
}

/// Canonicalize a raw `argv` (including `argv[0]`, the compiler executable)
/// plus the invocation's working directory and environment.
///
/// # Errors
///
/// Returns `CanonError::EmptyArgv` if `argv` has no elements.
pub fn canonicalize(
    argv: &[String],
    cwd: &str,
    env: &[(String, String)],
) -> Result<Command, CanonError> {
    let (executable, rest) = argv.split_first().ok_or(CanonError::EmptyArgv)?;

    let mut has_compile_flag = false;
    let mut inputs = Vec::new();
    let mut output = None;
    let mut language = None;
    let mut flags = FlagBuckets::default();

    let mut iter = rest.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-c" {
            has_compile_flag = true;
        } else if let Some(dir) = arg.strip_prefix("-I") {
            flags.include_dirs.push(if dir.is_empty() {
                iter.next().cloned().unwrap_or_default()
            } else {
                dir.to_string()
            });
        } else if let Some(def) = arg.strip_prefix("-D") {
            flags.defines.push(if def.is_empty() {
                iter.next().cloned().unwrap_or_default()
            } else {
                def.to_string()
            });
        } else if let Some(std) = arg.strip_prefix("-std=") {
            flags.language_standard = Some(std.to_string());
        } else if arg.starts_with("-O") {
            flags.optimization = Some(arg.clone());
        } else if arg == "-g" || arg.starts_with("-ggdb") {
            flags.debug.push(arg.clone());
        } else if arg == "-target" {
            flags.target_triple = iter.next().cloned();
        } else if arg == "-o" {
            output = iter.next().cloned();
        } else if arg == "-x" {
            language = iter.next().cloned();
        } else if is_cache_irrelevant(arg) {
            // Retained in args via the loop's `rest` capture below, but not
            // bucketed: cache-key projection skips `other` entries here.
        } else if !arg.starts_with('-') {
            inputs.push(arg.clone());
        } else {
            flags.other.push(arg.clone());
        }
    }

    let action = if has_compile_flag && inputs.len() <= 1 {
        Action::Compile
    } else if !inputs.is_empty() {
        Action::Link
    } else {
        Action::Unknown
    };

    Ok(Command {
        action,
        executable: executable.clone(),
        cwd: cwd.to_string(),
        args: rest.to_vec(),
        env: env.to_vec(),
        inputs,
        output,
        language,
        flags,
    })
}

fn is_cache_irrelevant(arg: &str) -> bool {
    CACHE_IRRELEVANT_PREFIXES.iter().any(|p| arg.starts_with(p))
}

/// Flags retained in the cache-key projection: the `other` bucket with
/// irrelevant diagnostic flags already excluded at canonicalization time,
/// plus every other bucket. Order is deterministic given a deterministic
/// input `Command`.
#[must_use]
pub fn cache_key_projection(cmd: &Command) -> BTreeMap<&'static str, String> {
    let mut out = BTreeMap::new();
    out.insert("include_dirs", cmd.flags.include_dirs.join(";"));
    out.insert("defines", cmd.flags.defines.join(";"));
    if let Some(std) = &cmd.flags.language_standard {
        out.insert("std", std.clone());
    }
    if let Some(opt) = &cmd.flags.optimization {
        out.insert("opt", opt.clone());
    }
    out.insert("debug", cmd.flags.debug.join(";"));
    if let Some(target) = &cmd.flags.target_triple {
        out.insert("target", target.clone());
    }
    out.insert("codegen", cmd.flags.codegen.join(";"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &[&str]) -> Vec<String> {
        s.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn classifies_compile() {
        let cmd = canonicalize(&argv(&["clang++", "-c", "a.cc", "-o", "a.o"]), "/tmp", &[]).unwrap();
        assert_eq!(cmd.action, Action::Compile);
        assert_eq!(cmd.inputs, vec!["a.cc".to_string()]);
        assert_eq!(cmd.output, Some("a.o".to_string()));
    }

    #[test]
    fn classifies_link() {
        let cmd = canonicalize(&argv(&["clang++", "a.o", "b.o", "-o", "out"]), "/tmp", &[]).unwrap();
        assert_eq!(cmd.action, Action::Link);
    }

    #[test]
    fn classifies_unknown_with_no_inputs() {
        let cmd = canonicalize(&argv(&["clang++", "--version"]), "/tmp", &[]).unwrap();
        assert_eq!(cmd.action, Action::Unknown);
    }

    #[test]
    fn preserves_include_dir_order() {
        let cmd = canonicalize(
            &argv(&["clang++", "-c", "a.cc", "-Ifoo", "-Ibar", "-Ibaz"]),
            "/tmp",
            &[],
        )
        .unwrap();
        assert_eq!(cmd.flags.include_dirs, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let cmd1 = canonicalize(&argv(&["clang++", "-c", "a.cc", "-DFOO=1", "-O2"]), "/tmp", &[]).unwrap();
        // canon(canon(c)) = canon(c): re-deriving a Command from its own
        // args vector reproduces the same Command.
        let cmd2 = canonicalize(&cmd1.args_with_executable(), "/tmp", &[]).unwrap();
        assert_eq!(cmd1, cmd2);
    }

    #[test]
    fn empty_argv_errors() {
        assert!(matches!(canonicalize(&[], "/tmp", &[]), Err(CanonError::EmptyArgv)));
    }
}

impl Command {
    /// Reconstructs an `argv`-shaped vector (`executable` followed by
    /// `args`), the input `canonicalize` expects — used to state and test
    /// the idempotence invariant `canon(canon(c)) == canon(c)`.
    #[must_use]
    pub fn args_with_executable(&self) -> Vec<String> {
        std::iter::once(self.executable.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}
