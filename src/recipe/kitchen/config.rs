// src/recipe/kitchen/config.rs

//! Configuration and result types for the Kitchen

use crate::error::{Error, ErrorClass, Result};
use crate::fetch::RetryPolicy;
use crate::recipe::cache::ArtifactSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::sandbox::DEFAULT_ENV_ALLOW_LIST;

/// Configuration for the Kitchen
///
/// Loaded from an optional TOML file; every field has a default so a
/// config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KitchenConfig {
    /// State root: prefixes, index, caches
    pub root: PathBuf,
    /// Concurrent formula builds, also `{jobs}` and `MAKEFLAGS`
    pub jobs: usize,
    /// Per-step timeout in seconds (0 = no limit)
    pub step_timeout_secs: u64,
    /// Host variables passed through to build and test steps
    pub env_allow_list: Vec<String>,
    /// Attempts per download
    pub fetch_attempts: u32,
    /// Base delay between download attempts, multiplied by the attempt
    pub fetch_retry_delay_ms: u64,
    /// Keep build directories after a failed build
    pub keep_builddir: bool,
    /// Cancel the run on the first fatal failure
    pub fail_fast: bool,
    /// Run post-install tests of requested formulas
    pub run_tests: bool,
    /// Ignore bottles
    pub build_from_source: bool,
}

/// `~/.local/share/formulary`, or `./.formulary` without a data dir
pub fn default_root() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("formulary"))
        .unwrap_or_else(|| PathBuf::from(".formulary"))
}

impl Default for KitchenConfig {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);

        Self {
            root: default_root(),
            jobs,
            step_timeout_secs: 3600, // 1 hour
            env_allow_list: DEFAULT_ENV_ALLOW_LIST.iter().map(|s| s.to_string()).collect(),
            fetch_attempts: 3,
            fetch_retry_delay_ms: 1000,
            keep_builddir: false,
            fail_fast: false,
            run_tests: true,
            build_from_source: false,
        }
    }
}

impl KitchenConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::IoError(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        if config.jobs == 0 {
            return Err(Error::ParseError(format!(
                "{}: jobs must be at least 1",
                path.display()
            )));
        }
        Ok(config)
    }

    /// Config rooted at `root`, defaults otherwise
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_secs > 0).then(|| Duration::from_secs(self.step_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts.max(1),
            base_delay: Duration::from_millis(self.fetch_retry_delay_ms),
        }
    }
}

/// Per-formula execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CookState {
    Pending,
    Fetching,
    Patching,
    Building,
    Installing,
    Installed,
    Failed,
}

impl CookState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookState::Pending => "pending",
            CookState::Fetching => "fetching",
            CookState::Patching => "patching",
            CookState::Building => "building",
            CookState::Installing => "installing",
            CookState::Installed => "installed",
            CookState::Failed => "failed",
        }
    }

    /// Whether `next` may follow this state
    pub fn can_advance_to(self, next: CookState) -> bool {
        use CookState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Installed)
                | (Fetching, Patching)
                | (Fetching, Building)
                | (Fetching, Installing)
                | (Patching, Building)
                | (Building, Installing)
                | (Installing, Installed)
        ) || (next == Failed && !matches!(self, Installed | Failed))
    }
}

impl fmt::Display for CookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a formula ended up installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    /// Already in the cache; nothing ran
    Cached,
    Bottle,
    Built,
}

impl InstallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallKind::Cached => "cached",
            InstallKind::Bottle => "bottle",
            InstallKind::Built => "built",
        }
    }
}

impl From<ArtifactSource> for InstallKind {
    fn from(source: ArtifactSource) -> Self {
        match source {
            ArtifactSource::Built => InstallKind::Built,
            ArtifactSource::Bottle => InstallKind::Bottle,
        }
    }
}

/// Final outcome of one formula in a run
#[derive(Debug)]
pub enum CookOutcome {
    Installed {
        kind: InstallKind,
        prefix: PathBuf,
        /// Failures of post-install tests; the install stands
        test_failures: Vec<Error>,
    },
    Failed {
        /// State the formula was in when it failed
        stage: CookState,
        error: Error,
    },
    /// Not attempted because a dependency failed
    Skipped { root_cause: String },
}

impl CookOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, CookOutcome::Installed { .. })
    }

    /// Error class driving the exit code, `None` for a clean install
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            CookOutcome::Installed { test_failures, .. } if test_failures.is_empty() => None,
            CookOutcome::Installed { .. } => Some(ErrorClass::Test),
            CookOutcome::Failed { error, .. } => Some(error.class()),
            CookOutcome::Skipped { .. } => Some(ErrorClass::Build),
        }
    }
}

/// Result of cooking one formula
#[derive(Debug)]
pub struct CookResult {
    pub name: String,
    /// Every state the formula passed through, in order
    pub states: Vec<CookState>,
    pub outcome: CookOutcome,
    /// Build log
    pub log: String,
}

impl CookResult {
    pub fn skipped(name: &str, root_cause: &str) -> Self {
        Self {
            name: name.to_string(),
            states: vec![CookState::Pending],
            outcome: CookOutcome::Skipped {
                root_cause: root_cause.to_string(),
            },
            log: String::new(),
        }
    }

    pub fn final_state(&self) -> CookState {
        self.states.last().copied().unwrap_or(CookState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kitchen_config_default() {
        let config = KitchenConfig::default();
        assert!(config.jobs > 0);
        assert!(config.run_tests);
        assert!(!config.fail_fast);
        assert!(config.env_allow_list.iter().any(|v| v == "PATH"));
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_kitchen_config_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "jobs = 2\nstep_timeout_secs = 0\nenv_allow_list = [\"PATH\", \"GOPROXY\"]\n",
        )
        .unwrap();

        let config = KitchenConfig::load(&path).unwrap();
        assert_eq!(config.jobs, 2);
        assert_eq!(config.step_timeout(), None);
        assert_eq!(config.env_allow_list, vec!["PATH", "GOPROXY"]);
        assert_eq!(config.fetch_attempts, 3);
    }

    #[test]
    fn test_kitchen_config_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "use_isolation = true\n").unwrap();
        assert!(KitchenConfig::load(&path).is_err());
    }

    #[test]
    fn test_state_transitions() {
        assert!(CookState::Pending.can_advance_to(CookState::Fetching));
        assert!(CookState::Fetching.can_advance_to(CookState::Patching));
        assert!(CookState::Fetching.can_advance_to(CookState::Building));
        assert!(CookState::Building.can_advance_to(CookState::Failed));
        assert!(!CookState::Building.can_advance_to(CookState::Patching));
        assert!(!CookState::Installed.can_advance_to(CookState::Failed));
    }

    #[test]
    fn test_outcome_classes() {
        let ok = CookOutcome::Installed {
            kind: InstallKind::Built,
            prefix: PathBuf::from("/p"),
            test_failures: Vec::new(),
        };
        assert_eq!(ok.error_class(), None);

        let tests_failed = CookOutcome::Installed {
            kind: InstallKind::Built,
            prefix: PathBuf::from("/p"),
            test_failures: vec![Error::TestFailed {
                description: "wiki --version".to_string(),
            }],
        };
        assert_eq!(tests_failed.error_class(), Some(ErrorClass::Test));
    }
}
