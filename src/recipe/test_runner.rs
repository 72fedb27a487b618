// src/recipe/test_runner.rs

//! Post-install tests
//!
//! Tests run against the installed prefix, never the build tree. Each
//! formula gets one fresh `{testpath}` directory that is also the working
//! directory of every step, so later steps can use files earlier steps
//! created. The first failing assertion ends the run; the install itself
//! is never rolled back.

use crate::error::{Error, Result};
use crate::recipe::format::TestStep;
use crate::recipe::formula::Formula;
use crate::recipe::kitchen::{
    CancellationToken, CommandOutput, CommandRunner, CommandSpec, Environment,
};
use crate::recipe::placeholder::Substitutions;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Outcome of a formula's test steps
#[derive(Debug, Default)]
pub struct TestReport {
    /// Descriptions of steps that passed
    pub passed: Vec<String>,
    /// First failed assertion, as [`Error::TestFailed`]
    pub failure: Option<Error>,
}

impl TestReport {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs test steps through a [`CommandRunner`]
pub struct TestRunner<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
    allow_list: &'a [String],
    timeout: Option<Duration>,
    jobs: usize,
}

impl<'a> TestRunner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cancel: &'a CancellationToken,
        allow_list: &'a [String],
    ) -> Self {
        Self {
            runner,
            cancel,
            allow_list,
            timeout: None,
            jobs: 1,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Run every test step of `formula` installed at `prefix`
    ///
    /// `dependencies` are the runtime closure plus test dependencies, as
    /// (name, installed prefix) pairs.
    pub fn run(
        &self,
        formula: &Formula,
        prefix: &Path,
        dependencies: &[(String, PathBuf)],
    ) -> Result<TestReport> {
        let mut report = TestReport::default();
        if formula.tests().is_empty() {
            debug!("{} has no test steps", formula.name());
            return Ok(report);
        }

        let scratch = TempDir::new()
            .map_err(|e| Error::IoError(format!("Failed to create test directory: {}", e)))?;
        let testpath = scratch.path().join("testpath");
        for dir in ["testpath", "home", "tmp"] {
            fs::create_dir_all(scratch.path().join(dir))?;
        }

        let mut subs = Substitutions::new(formula.name(), formula.version(), prefix, self.jobs)
            .with_testpath(&testpath);
        let mut env = Environment::from_host(self.allow_list)
            .work_dir(scratch.path())
            .dependency(prefix);
        for (name, dep_prefix) in dependencies {
            env = env.dependency(dep_prefix);
            if formula.dependency(name).is_some() {
                subs = subs.with_dependency(name, dep_prefix);
            }
        }
        let base_env = env;

        info!("Testing {} ({} steps)", formula.name(), formula.tests().len());
        for (i, step) in formula.tests().iter().enumerate() {
            self.cancel.check()?;
            let description = step.describe();
            debug!("Test step {}: {}", i + 1, description);

            let mut extra = std::collections::BTreeMap::new();
            for (key, value) in step.env() {
                extra.insert(key.clone(), subs.expand(value)?);
            }
            let spec = CommandSpec::new(subs.expand(step.program())?, &testpath)
                .args(subs.expand_args(step.args())?)
                .env(base_env.clone().extend(&extra).build())
                .timeout(self.timeout);

            let output = match self.runner.run(&spec, self.cancel) {
                Ok(output) => output,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    report.failure = Some(failed(&description, &e.to_string()));
                    break;
                }
            };

            match check_step(step, &output, &subs)? {
                None => report.passed.push(description),
                Some(reason) => {
                    report.failure = Some(failed(&description, &reason));
                    break;
                }
            }
        }

        match &report.failure {
            Some(failure) => warn!("{}: {}", formula.name(), failure),
            None => info!("{}: {} test steps passed", formula.name(), report.passed.len()),
        }
        Ok(report)
    }
}

fn failed(description: &str, reason: &str) -> Error {
    Error::TestFailed {
        description: format!("{description}: {reason}"),
    }
}

/// `None` if the step's assertion holds, otherwise the reason it does not
fn check_step(
    step: &TestStep,
    output: &CommandOutput,
    subs: &Substitutions,
) -> Result<Option<String>> {
    if output.timed_out {
        return Ok(Some("timed out".to_string()));
    }

    match step {
        TestStep::Run { .. } => Ok(match output.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("exited with {code}: {}", output.stderr_tail(5))),
            None => Some("terminated by a signal".to_string()),
        }),
        TestStep::AssertOutput {
            contains,
            matches,
            exit_code,
            ..
        } => {
            if output.exit_code != Some(*exit_code) {
                return Ok(Some(format!(
                    "expected exit code {}, got {}",
                    exit_code,
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "none".to_string())
                )));
            }

            let combined = output.combined();
            if let Some(literal) = contains {
                let expected = subs.expand(literal)?;
                if !combined.contains(&expected) {
                    return Ok(Some(format!(
                        "output does not contain {:?}: {}",
                        expected,
                        excerpt(&combined)
                    )));
                }
            }
            if let Some(pattern) = matches {
                let re = Regex::new(pattern)
                    .map_err(|e| Error::ParseError(format!("invalid pattern {pattern:?}: {e}")))?;
                if !re.is_match(&combined) {
                    return Ok(Some(format!(
                        "output does not match /{}/: {}",
                        pattern,
                        excerpt(&combined)
                    )));
                }
            }
            Ok(None)
        }
    }
}

fn excerpt(output: &str) -> String {
    const MAX: usize = 200;
    let trimmed = output.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::parser::parse_formula;
    use std::sync::Mutex;

    /// Replays canned outputs and records what ran
    struct Scripted {
        outputs: Mutex<Vec<CommandOutput>>,
        seen: Mutex<Vec<CommandSpec>>,
    }

    impl Scripted {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for Scripted {
        fn run(&self, spec: &CommandSpec, _cancel: &CancellationToken) -> Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec.clone());
            let mut outputs = self.outputs.lock().unwrap();
            Ok(if outputs.is_empty() {
                CommandOutput::default()
            } else {
                outputs.remove(0)
            })
        }
    }

    fn out(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            ..CommandOutput::default()
        }
    }

    fn wiki() -> Formula {
        parse_formula(
            r#"
[formula]
name = "wiki"
version = "1.4.1"
license = "MIT"

[source]
url = "https://github.com/walle/wiki/archive/refs/tags/v1.4.1.tar.gz"
checksum = "529c6a58b3b5c5eb3faab07f2bf752155868b912e4f753e432d14040ff4f4262"

[[test]]
step = "assert_output"
program = "{bin}/wiki"
args = ["--version"]
contains = "{version}"

[[test]]
step = "assert_output"
program = "{bin}/wiki"
args = ["golang"]
contains = "Read more: https://en.wikipedia.org/wiki/Go"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_passing_assertions() {
        let runner = Scripted::new(vec![
            out(0, "wiki 1.4.1\n"),
            out(0, "Go is a language.\nRead more: https://en.wikipedia.org/wiki/Go\n"),
        ]);
        let cancel = CancellationToken::new();
        let report = TestRunner::new(&runner, &cancel, &[])
            .run(&wiki(), Path::new("/cellar/wiki/1.4.1"), &[])
            .unwrap();

        assert!(report.success());
        assert_eq!(report.passed.len(), 2);

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].program, "/cellar/wiki/1.4.1/bin/wiki");
        assert_eq!(seen[0].args, vec!["--version"]);
        assert!(seen[0].env["PATH"].starts_with("/cellar/wiki/1.4.1/bin"));
        assert!(seen[0].cwd.ends_with("testpath"));
    }

    #[test]
    fn test_first_failure_stops_the_run() {
        let runner = Scripted::new(vec![out(0, "wiki 0.9.0\n"), out(0, "unused")]);
        let cancel = CancellationToken::new();
        let report = TestRunner::new(&runner, &cancel, &[])
            .run(&wiki(), Path::new("/cellar/wiki/1.4.1"), &[])
            .unwrap();

        match report.failure {
            Some(Error::TestFailed { description }) => {
                assert!(description.starts_with("wiki --version"));
                assert!(description.contains("1.4.1"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_regex_and_exit_code() {
        let formula = parse_formula(
            r#"
[formula]
name = "btrfs-progs"
version = "6.15"
license = "GPL-2.0-only"

[source]
url = "https://example.org/btrfs-progs-v6.15.tar.xz"
checksum = "57da428dd2199fd88d83ecf1cad05678ce78640ef7e52d7633be9887cef674bb"

[[test]]
step = "run"
program = "truncate"
args = ["-s", "128M", "{testpath}/test.img"]

[[test]]
step = "assert_output"
program = "{bin}/mkfs.btrfs"
args = ["{testpath}/test.img"]
matches = 'Filesystem size:\s*128\.00MiB'
description = "mkfs reports the image size"
"#,
        )
        .unwrap();

        let runner = Scripted::new(vec![
            out(0, ""),
            out(0, "Label: (null)\nFilesystem size:    128.00MiB\n"),
        ]);
        let cancel = CancellationToken::new();
        let report = TestRunner::new(&runner, &cancel, &[])
            .run(&formula, Path::new("/cellar/btrfs-progs/6.15"), &[])
            .unwrap();
        assert!(report.success(), "{:?}", report.failure);
        assert_eq!(report.passed[1], "mkfs reports the image size");

        let runner = Scripted::new(vec![out(1, ""), out(0, "")]);
        let report = TestRunner::new(&runner, &cancel, &[])
            .run(&formula, Path::new("/cellar/btrfs-progs/6.15"), &[])
            .unwrap();
        assert!(!report.success());
    }

    #[test]
    fn test_cancelled_before_start() {
        let runner = Scripted::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = TestRunner::new(&runner, &cancel, &[]).run(
            &wiki(),
            Path::new("/cellar/wiki/1.4.1"),
            &[],
        );
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
