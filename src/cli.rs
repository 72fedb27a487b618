// src/cli.rs
//! CLI definitions for formulary
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "formulary")]
#[command(author = "Formulary Contributors")]
#[command(version)]
#[command(about = "Build and install package formulas from declarative recipes", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory containing formula recipes (*.toml)
    #[arg(long, global = true, value_name = "DIR", default_value = "formulae")]
    pub formulae: PathBuf,

    /// State directory for prefixes, caches and the artifact index
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Kitchen configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Target platform key instead of the detected one (e.g. arm64_sonoma)
    #[arg(long, global = true, value_name = "KEY")]
    pub platform: Option<String>,

    /// Formulas built concurrently
    #[arg(short, long, global = true, value_name = "N")]
    pub jobs: Option<usize>,

    /// Stop all builds on the first failure
    #[arg(long, global = true)]
    pub fail_fast: bool,

    /// Skip post-install tests
    #[arg(long, global = true)]
    pub no_test: bool,

    /// Ignore bottles and build everything from source
    #[arg(long, global = true)]
    pub build_from_source: bool,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install formulas and their dependencies
    Install {
        /// Formula names
        #[arg(required = true)]
        formulas: Vec<String>,
    },

    /// Run the tests of an installed formula
    Test {
        /// Formula name
        formula: String,
    },

    /// Show the build plan without installing anything
    Plan {
        /// Formula names
        #[arg(required = true)]
        formulas: Vec<String>,

        /// Include test dependencies
        #[arg(long)]
        with_tests: bool,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download and verify a formula's source (and bottle, if any)
    Fetch {
        /// Formula name
        formula: String,
    },

    /// Pack an installed formula into a bottle archive
    Bottle {
        /// Formula name
        formula: String,

        /// Directory to write the archive to
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output: PathBuf,
    },

    /// List installed formulas
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Remove every installed artifact and cached download
    Clear,
}
