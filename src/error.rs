// src/error.rs

//! Error types for the formula build engine
//!
//! Every failure the engine can report maps onto one [`ErrorClass`], which
//! the CLI turns into a distinct exit code so scripts can tell a resolution
//! problem from a broken build, a tampered download or a failed smoke test.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading, resolving, building or testing formulas
#[derive(Error, Debug)]
pub enum Error {
    /// A recipe failed validation; `field` names the offending entry
    #[error("invalid recipe '{formula}': {field}: {reason}")]
    InvalidRecipe {
        formula: String,
        field: String,
        reason: String,
    },

    /// A dependency cycle, with the first node repeated at the end
    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// A dependency names a formula that is not known
    #[error("unknown formula '{name}'{}", required_by_suffix(.required_by))]
    UnknownFormula {
        name: String,
        required_by: Option<String>,
    },

    /// The formula declares platform requirements the target does not meet
    #[error("formula '{formula}' is not supported on {platform}")]
    UnsupportedPlatform { formula: String, platform: String },

    /// Downloaded or cached content does not match its declared checksum
    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// A patch hunk did not apply; the source tree was left untouched
    #[error("patch failed at hunk #{hunk} ({file}): {reason}")]
    PatchFailed {
        hunk: usize,
        file: String,
        reason: String,
    },

    /// Network or transport failure while fetching a source or bottle
    #[error("failed to fetch {url}: {reason}")]
    FetchError {
        url: String,
        reason: String,
        retryable: bool,
    },

    /// A build step exited non-zero (or was killed)
    #[error("build step {step} (`{command}`) failed{}", exit_suffix(.exit_code))]
    BuildStepFailed {
        step: usize,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A post-install assertion did not hold
    #[error("test failed: {description}")]
    TestFailed { description: String },

    /// A formula was not built because one of its dependencies failed
    #[error("dependency '{dependency}' failed")]
    DependencyFailed { dependency: String },

    /// The run was aborted by the user or by fail-fast
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    IoError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("initialization error: {0}")]
    InitError(String),

    #[error("not found: {0}")]
    NotFound(String),
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(parent) => format!(" (required by '{parent}')"),
        None => String::new(),
    }
}

fn exit_suffix(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!(" with exit code {code}"),
        None => " (terminated by signal or timeout)".to_string(),
    }
}

/// Coarse classification of an error, used for exit codes and summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad recipe, unknown formula, cycle, unsupported platform
    Resolution,
    /// Fetch, patch or build step failure
    Build,
    /// Integrity failure of a source or bottle
    Checksum,
    /// Post-install verification failure
    Test,
    /// User interrupt or fail-fast abort
    Interrupted,
    /// Anything else (I/O, database, ...)
    Other,
}

impl ErrorClass {
    /// Process exit code for this class
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Other => 1,
            ErrorClass::Resolution => 2,
            ErrorClass::Build => 3,
            ErrorClass::Checksum => 4,
            ErrorClass::Test => 5,
            ErrorClass::Interrupted => 130,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Resolution => "resolution",
            ErrorClass::Build => "build",
            ErrorClass::Checksum => "checksum",
            ErrorClass::Test => "test",
            ErrorClass::Interrupted => "interrupted",
            ErrorClass::Other => "error",
        }
    }
}

impl Error {
    /// Shorthand for [`Error::InvalidRecipe`]
    pub fn invalid_recipe(
        formula: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidRecipe {
            formula: formula.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidRecipe { .. }
            | Error::DependencyCycle { .. }
            | Error::UnknownFormula { .. }
            | Error::UnsupportedPlatform { .. } => ErrorClass::Resolution,
            Error::ChecksumMismatch { .. } => ErrorClass::Checksum,
            Error::PatchFailed { .. }
            | Error::FetchError { .. }
            | Error::BuildStepFailed { .. }
            | Error::DependencyFailed { .. } => ErrorClass::Build,
            Error::TestFailed { .. } => ErrorClass::Test,
            Error::Cancelled => ErrorClass::Interrupted,
            _ => ErrorClass::Other,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::FetchError { retryable: true, .. })
    }
}
