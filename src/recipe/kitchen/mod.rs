// src/recipe/kitchen/mod.rs

//! Kitchen: where formulas are cooked
//!
//! The Kitchen owns everything a single formula install needs: the
//! artifact cache, the fetcher, the subprocess runner and the bottle
//! selector. [`Kitchen::cook`] takes one entry of a build plan through
//!
//! 1. **Lookup**: an unchanged, intact install is a no-op
//! 2. **Pour**: a bottle for this platform is fetched, verified, unpacked
//!    into a staging directory and renamed into place
//! 3. **Cook**: otherwise the source is fetched, verified, patched and built
//!    straight into the final prefix, which is removed if the build fails
//! 4. **Taste**: post-install tests of requested formulas (advisory)
//!
//! The [`Scheduler`] runs cooks for a whole plan on a bounded worker pool.

mod archive;
mod config;
mod cook;
mod sandbox;
mod scheduler;

pub use archive::{ArchiveFormat, extract_archive, source_root};
pub use config::{CookOutcome, CookResult, CookState, InstallKind, KitchenConfig, default_root};
pub use sandbox::{
    CancellationToken, CommandOutput, CommandRunner, CommandSpec, DEFAULT_ENV_ALLOW_LIST,
    Environment, ProcessRunner,
};
pub use scheduler::{RunReport, Scheduler, install_interrupt_handler};

use crate::error::{Error, Result};
use crate::fetch::{Fetcher, fetch_verified};
use crate::hash::{Checksum, hash_file};
use crate::platform::Platform;
use crate::recipe::bottle::{BottleChoice, BottleSelector};
use crate::recipe::cache::{ArtifactCache, ArtifactKey};
use crate::recipe::formula::Formula;
use crate::recipe::plan::BuildPlan;
use crate::recipe::test_runner::{TestReport, TestRunner};
use cook::Cook;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The Kitchen: where formulas are cooked
pub struct Kitchen {
    config: KitchenConfig,
    cache: Arc<ArtifactCache>,
    fetcher: Arc<dyn Fetcher>,
    runner: Arc<dyn CommandRunner>,
    selector: BottleSelector,
    cancel: CancellationToken,
}

impl Kitchen {
    pub fn new(
        config: KitchenConfig,
        cache: Arc<ArtifactCache>,
        fetcher: Arc<dyn Fetcher>,
        runner: Arc<dyn CommandRunner>,
        platform: Platform,
    ) -> Self {
        let selector = if config.build_from_source {
            BottleSelector::disabled(platform)
        } else {
            BottleSelector::new(platform)
        };
        Self {
            config,
            cache,
            fetcher,
            runner,
            selector,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &KitchenConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn platform(&self) -> &Platform {
        self.selector.platform()
    }

    /// Token that aborts every cook of this kitchen
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub(crate) fn selector(&self) -> &BottleSelector {
        &self.selector
    }

    pub fn artifact_key(&self, formula: &Formula) -> ArtifactKey {
        ArtifactKey::new(formula.name(), formula.version(), &self.platform().key())
    }

    /// Final install prefix of a formula
    pub fn prefix_for(&self, formula: &Formula) -> PathBuf {
        self.cache
            .layout()
            .prefix(formula.name(), &formula.version_dir())
    }

    /// Cook one entry of `plan`
    pub fn cook(&self, plan: &BuildPlan, name: &str) -> CookResult {
        match plan.get(name) {
            Some(planned) => Cook::new(self, plan, planned).run(),
            None => CookResult {
                name: name.to_string(),
                states: vec![CookState::Pending, CookState::Failed],
                outcome: CookOutcome::Failed {
                    stage: CookState::Pending,
                    error: Error::UnknownFormula {
                        name: name.to_string(),
                        required_by: None,
                    },
                },
                log: String::new(),
            },
        }
    }

    /// Verified source archive, from the source cache or freshly fetched
    ///
    /// A cached file that no longer matches is discarded and fetched
    /// again; a fresh download that does not match is fatal.
    pub fn fetch_source(&self, formula: &Formula) -> Result<PathBuf> {
        let checksum = formula.checksum();
        let path = self.cache.layout().sources_dir().join(format!(
            "{}--{}",
            checksum.hex(),
            formula.source_filename()
        ));
        let subject = format!("source of {}", formula.name());
        self.fetch_cached(formula.source_url(), checksum, &path, &subject)?;
        Ok(path)
    }

    /// Verified bottle bytes, from the bottle cache or freshly fetched
    pub fn fetch_bottle(&self, formula: &Formula, choice: &BottleChoice) -> Result<Vec<u8>> {
        let path = self.cache.layout().bottles_dir().join(&choice.filename);
        let subject = format!("bottle of {} ({})", formula.name(), choice.platform_key);
        self.fetch_cached(&choice.url, &choice.checksum, &path, &subject)?;
        Ok(fs::read(&path)?)
    }

    fn fetch_cached(
        &self,
        url: &str,
        checksum: &Checksum,
        path: &Path,
        subject: &str,
    ) -> Result<()> {
        if path.exists() {
            let actual = hash_file(checksum.algorithm(), path)?;
            if actual.hex() == checksum.hex() {
                debug!("Using cached {}: {}", subject, path.display());
                return Ok(());
            }
            warn!(
                "Cached {} at {} is corrupt, fetching again",
                subject,
                path.display()
            );
            fs::remove_file(path)?;
        }

        self.cancel.check()?;
        info!("Fetching {} from {}", subject, url);
        let bytes = fetch_verified(self.fetcher.as_ref(), url, checksum, subject)?;

        let dir = path
            .parent()
            .ok_or_else(|| Error::IoError(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(path)
            .map_err(|e| Error::IoError(format!("Failed to store {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// (name, prefix) pairs for plan members, in the given order
    pub(crate) fn prefixes_of(&self, plan: &BuildPlan, names: &[String]) -> Vec<(String, PathBuf)> {
        names
            .iter()
            .filter_map(|name| plan.get(name))
            .map(|entry| (entry.name().to_string(), self.prefix_for(entry.formula())))
            .collect()
    }

    /// Run the tests of an installed plan member
    ///
    /// `plan` should be resolved with tests so test dependencies are known.
    pub fn test(&self, plan: &BuildPlan, name: &str) -> Result<TestReport> {
        let planned = plan.get(name).ok_or_else(|| Error::UnknownFormula {
            name: name.to_string(),
            required_by: None,
        })?;
        let formula = planned.formula();

        let installed = self
            .cache
            .lookup_current(&self.artifact_key(formula), formula.revision())?
            .ok_or_else(|| Error::NotFound(format!("{} is not installed", formula.name())))?;

        let deps = self.prefixes_of(plan, planned.test_closure());
        for (dep, prefix) in &deps {
            if !prefix.is_dir() {
                return Err(Error::NotFound(format!(
                    "test dependency {dep} of {name} is not installed"
                )));
            }
        }

        self.tester().run(formula, &installed.prefix, &deps)
    }

    pub(crate) fn tester(&self) -> TestRunner<'_> {
        TestRunner::new(self.runner(), &self.cancel, &self.config.env_allow_list)
            .timeout(self.config.step_timeout())
            .jobs(self.config.jobs)
    }
}
