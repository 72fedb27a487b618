// src/lib.rs

//! Formulary: a package-formula build engine
//!
//! Consumes declarative TOML recipes, resolves their dependencies, installs
//! prebuilt bottles when one exists for the current platform and builds
//! from source otherwise.
//!
//! # Architecture
//!
//! - Closed recipe schema: tagged build and test steps, explicit platform
//!   predicates, placeholders instead of embedded scripting
//! - Checksum gating: sources and bottles are verified before use, and a
//!   mismatch is never papered over
//! - Artifact index in SQLite: an unchanged formula installs once
//! - Explicit environments: build steps see only allow-listed host
//!   variables plus their dependency prefixes
//! - Parallel plans: independent formulas build concurrently on a bounded pool

mod error;
pub mod fetch;
pub mod hash;
pub mod platform;
pub mod recipe;

pub use error::{Error, ErrorClass, Result};
pub use fetch::{DefaultFetcher, Fetcher, FileFetcher, HttpFetcher, RetryPolicy, RetryingFetcher};
pub use hash::{Checksum, HashAlgorithm, Hasher};
pub use platform::{Platform, PlatformGate};
pub use recipe::{
    ArtifactCache, BuildPlan, Formula, FormulaSet, Kitchen, KitchenConfig, Layout, ResolveOptions,
    Resolver, RunReport, Scheduler,
};
