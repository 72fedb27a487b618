// src/recipe/mod.rs

//! Recipe system: formulas, resolution, bottles and building from source
//!
//! A recipe is a TOML file describing one formula: where its source comes
//! from, what it depends on, how to build and test it, and which prebuilt
//! bottles exist for which platforms.
//!
//! # Culinary Terminology
//!
//! - **Recipe**: The TOML file as written
//! - **Formula**: A validated recipe
//! - **Bottle**: A prebuilt prefix for one platform; installing one is a *pour*
//! - **Kitchen**: Where formulas are cooked
//! - **Cook**: Install one formula (lookup, pour or build, register)
//! - **Simmer**: Run the build steps
//! - **Taste**: Run the post-install tests
//!
//! # Example Recipe
//!
//! ```toml
//! [formula]
//! name = "wiki"
//! version = "1.4.1"
//! license = "MIT"
//!
//! [source]
//! url = "https://github.com/walle/wiki/archive/refs/tags/v1.4.1.tar.gz"
//! checksum = "sha256:529c6a58b3b5c5eb3faab07f2bf752155868b912e4f753e432d14040ff4f4262"
//!
//! [[dependencies]]
//! name = "go"
//! kind = ["build"]
//!
//! [[build]]
//! step = "run"
//! program = "go"
//! args = ["build", "{@std_go_args}", "-ldflags=-s -w", "./cmd/wiki"]
//!
//! [[test]]
//! step = "assert_output"
//! program = "{bin}/wiki"
//! args = ["--version"]
//! contains = "{version}"
//! ```

pub mod bottle;
pub mod cache;
mod format;
pub mod formula;
mod graph;
pub mod kitchen;
mod license;
pub mod parser;
pub mod patch;
pub mod placeholder;
pub mod plan;
pub mod test_runner;

pub use bottle::{BottleChoice, BottleManifest, BottleSelector};
pub use cache::{
    ArtifactCache, ArtifactKey, ArtifactSource, InstalledArtifact, Layout, ManifestEntry,
};
pub use format::{
    BottleSection, BuildStep, DependencyKind, DependencySpec, FormulaSection, PatchSection, Recipe,
    SourceSection, TestStep,
};
pub use formula::{Dependency, Formula, FormulaSet};
pub use graph::FormulaGraph;
pub use kitchen::{
    CookOutcome, CookResult, CookState, InstallKind, Kitchen, KitchenConfig, RunReport, Scheduler,
};
pub use license::License;
pub use parser::{load_formulas, parse_formula, parse_formula_file, parse_recipe, validate_recipe};
pub use patch::{Patch, PatchApplier, PatchReport};
pub use plan::{BuildPlan, PlannedDependency, PlannedFormula, ResolveOptions, Resolver};
pub use test_runner::{TestReport, TestRunner};
