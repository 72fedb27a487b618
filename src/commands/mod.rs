// src/commands/mod.rs
//! Command handlers for the formulary CLI
//!
//! Every handler returns the process exit code; hard errors bubble up as
//! `anyhow::Error` and are mapped to an exit code in `main`.

mod bottle;
mod cache;
mod fetch;
mod install;
mod list;
mod plan;

pub use bottle::cmd_bottle;
pub use cache::cmd_cache_clear;
pub use fetch::cmd_fetch;
pub use install::cmd_install;
pub use list::cmd_list;
pub use plan::cmd_plan;
pub use test::cmd_test;

use crate::cli::GlobalArgs;
use anyhow::{Context as _, Result};
use formulary::recipe::kitchen::ProcessRunner;
use formulary::recipe::{ArtifactCache, FormulaSet, Layout, load_formulas};
use formulary::{DefaultFetcher, Kitchen, KitchenConfig, Platform};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Everything a command needs, resolved from global flags and config
pub struct Context {
    pub config: KitchenConfig,
    pub formulae: PathBuf,
    pub platform: Platform,
}

impl Context {
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let mut config = match config_path(args.config.as_deref()) {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                KitchenConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?
            }
            None => KitchenConfig::default(),
        };

        if let Some(root) = &args.root {
            config.root = root.clone();
        }
        if let Some(jobs) = args.jobs {
            anyhow::ensure!(jobs > 0, "--jobs must be at least 1");
            config.jobs = jobs;
        }
        config.fail_fast |= args.fail_fast;
        config.build_from_source |= args.build_from_source;
        if args.no_test {
            config.run_tests = false;
        }

        let platform = match &args.platform {
            Some(key) => Platform::parse_key(key)?,
            None => Platform::detect(),
        };

        Ok(Self {
            config,
            formulae: args.formulae.clone(),
            platform,
        })
    }

    pub fn load_formulas(&self) -> Result<FormulaSet> {
        Ok(load_formulas(&self.formulae)?)
    }

    pub fn open_cache(&self) -> Result<ArtifactCache> {
        ArtifactCache::open(Layout::new(&self.config.root)).with_context(|| {
            format!(
                "Failed to open artifact cache in {}",
                self.config.root.display()
            )
        })
    }

    pub fn kitchen(&self) -> Result<Kitchen> {
        let cache = Arc::new(self.open_cache()?);
        let fetcher = Arc::new(DefaultFetcher::new(self.config.retry_policy())?);
        Ok(Kitchen::new(
            self.config.clone(),
            cache,
            fetcher,
            Arc::new(ProcessRunner::new()),
            self.platform.clone(),
        ))
    }
}

/// Explicit `--config`, else `<config dir>/formulary/config.toml` if present
fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    dirs::config_dir()
        .map(|dir| dir.join("formulary").join("config.toml"))
        .filter(|path| path.is_file())
}
