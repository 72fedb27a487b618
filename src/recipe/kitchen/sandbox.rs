// src/recipe/kitchen/sandbox.rs

//! Subprocess execution for build and test steps
//!
//! Every step runs with an environment built from scratch: a small
//! allow-list copied from the host, `HOME`/`TMPDIR` inside the formula's
//! private work directory, and search paths for the dependency prefixes.
//! Steps run in their own process group so a timeout or cancellation can
//! kill the whole tree a build tool spawned.

use crate::error::{Error, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How often a running step checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared abort flag for a run
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A fully resolved command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Complete environment; nothing else is inherited
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: cwd.to_path_buf(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when killed by a signal or the timeout
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Last `lines` lines of stderr
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Runs subprocesses for the executor and the test runner
pub trait CommandRunner: Send + Sync {
    /// Run to completion; `Err(Cancelled)` if the token fires first
    fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        (**self).run(spec, cancel)
    }
}

/// Real subprocesses, one process group per command
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

fn read_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_group(pid: u32) {
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pid, e);
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandOutput> {
        cancel.check()?;
        debug!("Running `{}` in {}", spec.display(), spec.cwd.display());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| Error::IoError(format!("Failed to spawn `{}`: {}", spec.program, e)))?;

        let stdout = read_pipe(child.stdout.take());
        let stderr = read_pipe(child.stderr.take());
        let started = Instant::now();

        let mut timed_out = false;
        let mut cancelled = false;
        let status = loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                break Some(status);
            }
            if cancel.is_cancelled() {
                cancelled = true;
            } else if spec.timeout.is_some_and(|limit| started.elapsed() >= limit) {
                warn!("`{}` timed out after {:?}", spec.display(), started.elapsed());
                timed_out = true;
            } else {
                continue;
            }
            kill_group(child.id());
            let _ = child.wait();
            break None;
        };

        let stdout = String::from_utf8_lossy(&stdout.join().unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned();

        if cancelled {
            return Err(Error::Cancelled);
        }

        Ok(CommandOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out,
        })
    }
}

/// Host variables copied into every step's environment by default
pub const DEFAULT_ENV_ALLOW_LIST: &[&str] = &["PATH", "LANG", "LC_ALL", "LC_CTYPE", "TERM"];

/// Builds the explicit environment of one step
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
    path: Vec<PathBuf>,
    pkg_config_path: Vec<PathBuf>,
    cpath: Vec<PathBuf>,
    library_path: Vec<PathBuf>,
    cmake_prefix_path: Vec<PathBuf>,
}

impl Environment {
    /// Start from the allow-listed variables of the current process
    pub fn from_host(allow_list: &[String]) -> Self {
        Self::from_vars(allow_list, std::env::vars_os())
    }

    /// Start from the allow-listed subset of `vars`
    pub fn from_vars<I>(allow_list: &[String], vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let vars = vars
            .into_iter()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .filter(|(k, _)| allow_list.iter().any(|allowed| allowed == k))
            .collect();
        Self {
            vars,
            ..Self::default()
        }
    }

    /// Point `HOME` and `TMPDIR` into the private work directory
    pub fn work_dir(mut self, dir: &Path) -> Self {
        self.vars.insert("HOME".to_string(), dir.join("home").display().to_string());
        self.vars.insert("TMPDIR".to_string(), dir.join("tmp").display().to_string());
        self
    }

    /// Add a dependency prefix to the search paths
    pub fn dependency(mut self, prefix: &Path) -> Self {
        self.path.push(prefix.join("bin"));
        self.path.push(prefix.join("sbin"));
        self.pkg_config_path.push(prefix.join("lib/pkgconfig"));
        self.pkg_config_path.push(prefix.join("share/pkgconfig"));
        self.cpath.push(prefix.join("include"));
        self.library_path.push(prefix.join("lib"));
        self.cmake_prefix_path.push(prefix.to_path_buf());
        self
    }

    /// Prepend a directory to `PATH`
    pub fn prepend_path(mut self, dir: &Path) -> Self {
        self.path.insert(0, dir.to_path_buf());
        self
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn extend(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn build(self) -> BTreeMap<String, String> {
        let mut vars = self.vars;

        let host_path = vars.remove("PATH");
        let mut path = join_paths(&self.path);
        if let Some(host) = host_path.filter(|p| !p.is_empty()) {
            if !path.is_empty() {
                path.push(':');
            }
            path.push_str(&host);
        }
        if !path.is_empty() {
            vars.insert("PATH".to_string(), path);
        }

        for (key, dirs) in [
            ("PKG_CONFIG_PATH", &self.pkg_config_path),
            ("CPATH", &self.cpath),
            ("LIBRARY_PATH", &self.library_path),
            ("CMAKE_PREFIX_PATH", &self.cmake_prefix_path),
        ] {
            if !dirs.is_empty() {
                vars.entry(key.to_string()).or_insert_with(|| join_paths(dirs));
            }
        }
        vars
    }
}

fn join_paths(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn host() -> Vec<(OsString, OsString)> {
        vec![
            ("PATH".into(), "/usr/bin:/bin".into()),
            ("LANG".into(), "C.UTF-8".into()),
            ("SECRET_TOKEN".into(), "hunter2".into()),
            ("GOPATH".into(), "/home/user/go".into()),
        ]
    }

    #[test]
    fn test_environment_drops_unlisted_vars() {
        let env = Environment::from_vars(&allow(DEFAULT_ENV_ALLOW_LIST), host()).build();
        assert_eq!(env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert!(!env.contains_key("SECRET_TOKEN"));
        assert!(!env.contains_key("GOPATH"));
    }

    #[test]
    fn test_environment_dependency_search_paths() {
        let env = Environment::from_vars(&allow(&["PATH"]), host())
            .work_dir(Path::new("/work"))
            .dependency(Path::new("/cellar/zlib/1.3.1"))
            .dependency(Path::new("/cellar/go/1.24"))
            .build();

        assert_eq!(
            env["PATH"],
            "/cellar/zlib/1.3.1/bin:/cellar/zlib/1.3.1/sbin:/cellar/go/1.24/bin:/cellar/go/1.24/sbin:/usr/bin:/bin"
        );
        assert_eq!(env["CPATH"], "/cellar/zlib/1.3.1/include:/cellar/go/1.24/include");
        assert_eq!(env["LIBRARY_PATH"], "/cellar/zlib/1.3.1/lib:/cellar/go/1.24/lib");
        assert_eq!(env["CMAKE_PREFIX_PATH"], "/cellar/zlib/1.3.1:/cellar/go/1.24");
        assert!(env["PKG_CONFIG_PATH"].starts_with("/cellar/zlib/1.3.1/lib/pkgconfig:"));
        assert_eq!(env["HOME"], "/work/home");
        assert_eq!(env["TMPDIR"], "/work/tmp");
    }

    #[test]
    fn test_environment_without_dependencies_has_no_search_paths() {
        let env = Environment::from_vars(&[], host()).build();
        assert!(env.is_empty());
    }

    #[test]
    fn test_output_helpers() {
        let output = CommandOutput {
            exit_code: Some(2),
            stdout: "out".to_string(),
            stderr: "a\nb\nc\n".to_string(),
            timed_out: false,
        };
        assert!(!output.success());
        assert_eq!(output.combined(), "out\na\nb\nc\n");
        assert_eq!(output.stderr_tail(2), "b\nc");
    }

    #[test]
    fn test_process_runner_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("/bin/sh", dir.path())
            .args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = ProcessRunner::new()
            .run(&spec, &CancellationToken::new())
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[test]
    fn test_process_runner_clears_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("ONLY".to_string(), "this".to_string());
        let spec = CommandSpec::new("/bin/sh", dir.path())
            .args(["-c", "echo \"$ONLY:${HOME:-unset}\""])
            .env(env);
        let output = ProcessRunner::new()
            .run(&spec, &CancellationToken::new())
            .unwrap();
        assert_eq!(output.stdout.trim(), "this:unset");
    }

    #[test]
    fn test_process_runner_timeout_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("/bin/sh", dir.path())
            .args(["-c", "sleep 30 & sleep 30"])
            .timeout(Some(Duration::from_millis(300)));
        let started = Instant::now();
        let output = ProcessRunner::new()
            .run(&spec, &CancellationToken::new())
            .unwrap();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_process_runner_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let spec = CommandSpec::new("/bin/sh", dir.path()).args(["-c", "sleep 30"]);
        let result = ProcessRunner::new().run(&spec, &token);
        handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
