// src/recipe/kitchen/cook.rs

//! Cook: the install of a single formula

use crate::error::{Error, Result};
use crate::recipe::bottle::{BottleChoice, unpack_bottle};
use crate::recipe::cache::{ArtifactSource, InstalledArtifact, manifest_for};
use crate::recipe::format::BuildStep;
use crate::recipe::formula::Formula;
use crate::recipe::patch::PatchApplier;
use crate::recipe::placeholder::Substitutions;
use crate::recipe::plan::{BuildPlan, PlannedFormula};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::Kitchen;
use super::archive::{extract_archive, source_root};
use super::config::{CookOutcome, CookResult, CookState, InstallKind};
use super::sandbox::{CommandSpec, Environment};

/// Lines of stderr kept in a step failure
const STDERR_TAIL_LINES: usize = 20;

/// A single cook operation
pub(super) struct Cook<'a> {
    kitchen: &'a Kitchen,
    plan: &'a BuildPlan,
    planned: &'a PlannedFormula,
    formula: &'a Formula,
    states: Vec<CookState>,
    log: String,
}

/// Private directory of one source build
struct Workspace {
    dir: TempDir,
    prefix: PathBuf,
}

impl<'a> Cook<'a> {
    pub(super) fn new(
        kitchen: &'a Kitchen,
        plan: &'a BuildPlan,
        planned: &'a PlannedFormula,
    ) -> Self {
        Self {
            kitchen,
            plan,
            planned,
            formula: planned.formula(),
            states: vec![CookState::Pending],
            log: String::new(),
        }
    }

    fn state(&self) -> CookState {
        self.states.last().copied().unwrap_or(CookState::Pending)
    }

    fn advance(&mut self, next: CookState) {
        let current = self.state();
        debug_assert!(
            current.can_advance_to(next),
            "invalid transition {current} -> {next}"
        );
        info!("{}: {} -> {}", self.formula.name(), current, next);
        self.states.push(next);
    }

    fn log_line(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }

    pub(super) fn run(mut self) -> CookResult {
        let outcome = match self.install() {
            Ok((kind, prefix)) => {
                let test_failures = self.taste(kind, &prefix);
                CookOutcome::Installed {
                    kind,
                    prefix,
                    test_failures,
                }
            }
            Err(error) => {
                let stage = self.state();
                warn!("{}: failed while {}: {}", self.formula.name(), stage, error);
                self.log_line(&format!("failed while {stage}: {error}"));
                self.advance(CookState::Failed);
                CookOutcome::Failed { stage, error }
            }
        };

        CookResult {
            name: self.formula.name().to_string(),
            states: self.states,
            outcome,
            log: self.log,
        }
    }

    fn install(&mut self) -> Result<(InstallKind, PathBuf)> {
        let cache = self.kitchen.cache();
        let key = self.kitchen.artifact_key(self.formula);
        self.kitchen.cancel_token().check()?;

        if let Some(existing) = cache.lookup_current(&key, self.formula.revision())? {
            info!("{} is already installed", key);
            self.advance(CookState::Installed);
            return Ok((InstallKind::Cached, existing.prefix));
        }

        let _lock = cache.lock(&key)?;
        // Someone else may have installed it while we waited
        if let Some(existing) = cache.lookup_current(&key, self.formula.revision())? {
            info!("{} was installed concurrently", key);
            self.advance(CookState::Installed);
            return Ok((InstallKind::Cached, existing.prefix));
        }

        match self.kitchen.selector().select(self.formula) {
            Some(choice) => self.pour(&choice),
            None => self.cook_from_source(),
        }
    }

    /// Install from a bottle
    fn pour(&mut self, choice: &BottleChoice) -> Result<(InstallKind, PathBuf)> {
        self.advance(CookState::Fetching);
        let bytes = self.kitchen.fetch_bottle(self.formula, choice)?;
        self.log_line(&format!("Fetched bottle {}", choice.url));

        self.advance(CookState::Installing);
        let work = self.workspace()?;
        unpack_bottle(
            &bytes,
            self.formula.name(),
            &self.formula.version_dir(),
            &work.prefix,
        )?;
        let prefix = self.place(&work.prefix)?;
        self.register(
            &prefix,
            ArtifactSource::Bottle,
            choice.checksum.to_prefixed_string(),
        )?;
        Ok((InstallKind::Bottle, prefix))
    }

    /// Fetch, patch, build and install from source
    fn cook_from_source(&mut self) -> Result<(InstallKind, PathBuf)> {
        self.advance(CookState::Fetching);
        let archive = self.kitchen.fetch_source(self.formula)?;
        self.log_line(&format!("Fetched source {}", self.formula.source_url()));

        let work = self.workspace()?;
        let unpacked = work.dir.path().join("src");
        extract_archive(&archive, &unpacked)?;
        let root = source_root(&unpacked)?;
        debug!("Source directory: {}", root.display());

        if let Some(patch) = self.formula.patch() {
            self.advance(CookState::Patching);
            let report = PatchApplier::new().apply(patch, &root)?;
            self.log_line(&format!(
                "Applied {} hunk(s) to {} file(s)",
                report.hunks,
                report.modified.len() + report.created.len() + report.deleted.len()
            ));
        }

        // Builds run against the final prefix so embedded paths stay valid
        let prefix = self.fresh_prefix()?;
        self.advance(CookState::Building);
        if let Err(e) = self.simmer(&work, &root, &prefix) {
            discard_prefix(&prefix);
            self.keep_on_failure(work);
            return Err(e);
        }

        self.advance(CookState::Installing);
        let checksum = self.formula.checksum().to_prefixed_string();
        if let Err(e) = self.register(&prefix, ArtifactSource::Built, checksum) {
            discard_prefix(&prefix);
            return Err(e);
        }
        Ok((InstallKind::Built, prefix))
    }

    fn workspace(&self) -> Result<Workspace> {
        let tmp = self.kitchen.cache().layout().tmp_dir();
        fs::create_dir_all(&tmp)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", self.formula.name()))
            .tempdir_in(&tmp)
            .map_err(|e| Error::IoError(format!("Failed to create build directory: {}", e)))?;
        let prefix = dir.path().join("prefix");
        for sub in ["prefix", "home", "tmp"] {
            fs::create_dir_all(dir.path().join(sub))?;
        }
        Ok(Workspace { dir, prefix })
    }

    fn keep_on_failure(&self, work: Workspace) {
        if self.kitchen.config().keep_builddir {
            #[allow(deprecated)]
            let kept = work.dir.into_path();
            warn!("Keeping build directory {}", kept.display());
        }
    }

    fn substitutions(&self, prefix: &Path, buildpath: &Path) -> Substitutions {
        let mut subs = Substitutions::new(
            self.formula.name(),
            self.formula.version(),
            prefix,
            self.kitchen.config().jobs,
        )
        .with_buildpath(buildpath);
        let closure = self.planned.build_closure();
        for (name, dep_prefix) in self.kitchen.prefixes_of(self.plan, closure) {
            if self.formula.dependency(&name).is_some() {
                subs = subs.with_dependency(&name, &dep_prefix);
            }
        }
        subs
    }

    fn environment(&self, work: &Workspace, prefix: &Path) -> Environment {
        let jobs = self.kitchen.config().jobs;
        let mut env = Environment::from_host(&self.kitchen.config().env_allow_list)
            .work_dir(work.dir.path());
        for (_, prefix) in self.kitchen.prefixes_of(self.plan, self.planned.build_closure()) {
            env = env.dependency(&prefix);
        }
        env.set("FORMULARY_PREFIX", prefix.display().to_string())
            .set("FORMULARY_JOBS", jobs.to_string())
            .set("MAKEFLAGS", format!("-j{jobs}"))
    }

    /// Run the build steps in order
    fn simmer(&mut self, work: &Workspace, root: &Path, prefix: &Path) -> Result<()> {
        let subs = self.substitutions(prefix, root);
        let env = self.environment(work, prefix);

        for (i, step) in self.formula.build_steps().iter().enumerate() {
            self.kitchen.cancel_token().check()?;
            let index = i + 1;
            info!("{}: step {}: {}", self.formula.name(), index, step.describe());

            match step {
                BuildStep::Run {
                    program,
                    args,
                    env: extra,
                    workdir,
                } => {
                    let mut step_env = BTreeMap::new();
                    for (key, value) in extra {
                        step_env.insert(key.clone(), subs.expand(value)?);
                    }
                    let cwd = match workdir {
                        Some(dir) => root.join(subs.expand(dir)?),
                        None => root.to_path_buf(),
                    };
                    let spec = CommandSpec::new(subs.expand(program)?, &cwd)
                        .args(subs.expand_args(args)?)
                        .env(env.clone().extend(&step_env).build())
                        .timeout(self.kitchen.config().step_timeout());
                    self.run_command(index, &spec)?;
                }
                BuildStep::InstallFile { from, to, mode } => {
                    let source = root.join(subs.expand(from)?);
                    let dest = within_prefix(prefix, &subs.expand(to)?)
                        .map_err(|reason| step_failed(index, step, reason))?;
                    install_file(&source, &dest, *mode)
                        .map_err(|e| step_failed(index, step, e.to_string()))?;
                    self.log_line(&format!("installed {}", dest.display()));
                }
                BuildStep::Mkdir { path } => {
                    let dest = within_prefix(prefix, &subs.expand(path)?)
                        .map_err(|reason| step_failed(index, step, reason))?;
                    fs::create_dir_all(&dest)
                        .map_err(|e| step_failed(index, step, e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn run_command(&mut self, index: usize, spec: &CommandSpec) -> Result<()> {
        let command = spec.display();
        let output = match self.kitchen.runner().run(spec, self.kitchen.cancel_token()) {
            Ok(output) => output,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                return Err(Error::BuildStepFailed {
                    step: index,
                    command,
                    exit_code: None,
                    stderr: e.to_string(),
                });
            }
        };

        self.log_line(&format!("==> {command}"));
        if !output.stdout.is_empty() {
            self.log.push_str(&output.stdout);
        }
        if !output.stderr.is_empty() {
            self.log.push_str(&output.stderr);
        }

        if output.success() {
            return Ok(());
        }
        let mut stderr = output.stderr_tail(STDERR_TAIL_LINES);
        if output.timed_out {
            stderr = format!("timed out\n{stderr}");
        }
        Err(Error::BuildStepFailed {
            step: index,
            command,
            exit_code: output.exit_code,
            stderr,
        })
    }

    /// Empty final prefix for a source build
    fn fresh_prefix(&self) -> Result<PathBuf> {
        let prefix = self.clear_prefix()?;
        fs::create_dir_all(&prefix)?;
        Ok(prefix)
    }

    /// Final prefix with any unregistered leftovers removed
    fn clear_prefix(&self) -> Result<PathBuf> {
        let prefix = self.kitchen.prefix_for(self.formula);
        if prefix.exists() {
            debug!("Replacing unregistered prefix {}", prefix.display());
            fs::remove_dir_all(&prefix)?;
        }
        Ok(prefix)
    }

    /// Move an unpacked bottle into the final prefix
    fn place(&self, staging: &Path) -> Result<PathBuf> {
        let prefix = self.clear_prefix()?;
        if let Some(parent) = prefix.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging, &prefix)?;
        Ok(prefix)
    }

    /// Record a populated prefix in the artifact cache
    fn register(
        &mut self,
        prefix: &Path,
        source: ArtifactSource,
        checksum: String,
    ) -> Result<()> {
        let artifact = InstalledArtifact {
            name: self.formula.name().to_string(),
            version: self.formula.version().to_string(),
            revision: self.formula.revision(),
            platform_key: self.kitchen.platform().key(),
            files: manifest_for(prefix)?,
            prefix: prefix.to_path_buf(),
            source,
            checksum,
            runtime_dependencies: self.planned.runtime_closure().to_vec(),
            installed_at: Utc::now(),
        };
        self.kitchen.cache().register(&artifact)?;
        self.log_line(&format!(
            "Installed {} files into {}",
            artifact.files.len(),
            prefix.display()
        ));
        self.advance(CookState::Installed);
        Ok(())
    }

    /// Post-install tests; failures are reported, never fatal
    fn taste(&mut self, kind: InstallKind, prefix: &Path) -> Vec<Error> {
        if kind == InstallKind::Cached
            || !self.planned.is_requested()
            || !self.kitchen.config().run_tests
            || self.formula.tests().is_empty()
        {
            return Vec::new();
        }

        let deps = self.kitchen.prefixes_of(self.plan, self.planned.test_closure());
        match self.kitchen.tester().run(self.formula, prefix, &deps) {
            Ok(report) => report.failure.into_iter().collect(),
            Err(e) => vec![e],
        }
    }
}

fn discard_prefix(prefix: &Path) {
    if let Err(e) = fs::remove_dir_all(prefix) {
        warn!("Failed to remove incomplete prefix {}: {}", prefix.display(), e);
    }
}

fn step_failed(index: usize, step: &BuildStep, reason: String) -> Error {
    Error::BuildStepFailed {
        step: index,
        command: step.describe(),
        exit_code: None,
        stderr: reason,
    }
}

/// Resolve an install destination, which must stay inside `prefix`
fn within_prefix(prefix: &Path, dest: &str) -> std::result::Result<PathBuf, String> {
    let path = Path::new(dest);
    let relative = if path.is_absolute() {
        path.strip_prefix(prefix)
            .map_err(|_| format!("{dest} is outside the install prefix"))?
    } else {
        path
    };
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!("{dest} is outside the install prefix"));
    }
    Ok(prefix.join(relative))
}

fn install_file(source: &Path, dest: &Path, mode: Option<u32>) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    if let Some(mode) = mode {
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}
