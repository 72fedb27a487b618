// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn formula_arg() -> Arg {
    Arg::new("formula").required(true).help("Formula name")
}

fn build_cli() -> Command {
    Command::new("formulary")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Formulary Contributors")
        .about("Build and install package formulas from declarative recipes")
        .subcommand_required(true)
        .arg(
            Arg::new("formulae")
                .long("formulae")
                .value_name("DIR")
                .default_value("formulae")
                .global(true)
                .help("Directory containing formula recipes (*.toml)"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("DIR")
                .global(true)
                .help("State directory for prefixes, caches and the artifact index"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Kitchen configuration file"),
        )
        .arg(
            Arg::new("platform")
                .long("platform")
                .value_name("KEY")
                .global(true)
                .help("Target platform key instead of the detected one"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("N")
                .global(true)
                .help("Formulas built concurrently"),
        )
        .arg(
            Arg::new("fail_fast")
                .long("fail-fast")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Stop all builds on the first failure"),
        )
        .arg(
            Arg::new("no_test")
                .long("no-test")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Skip post-install tests"),
        )
        .arg(
            Arg::new("build_from_source")
                .long("build-from-source")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Ignore bottles and build everything from source"),
        )
        .subcommand(
            Command::new("install")
                .about("Install formulas and their dependencies")
                .arg(Arg::new("formulas").required(true).num_args(1..).help("Formula names")),
        )
        .subcommand(
            Command::new("test")
                .about("Run the tests of an installed formula")
                .arg(formula_arg()),
        )
        .subcommand(
            Command::new("plan")
                .about("Show the build plan without installing anything")
                .arg(Arg::new("formulas").required(true).num_args(1..).help("Formula names"))
                .arg(
                    Arg::new("with_tests")
                        .long("with-tests")
                        .action(ArgAction::SetTrue)
                        .help("Include test dependencies"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the plan as JSON"),
                ),
        )
        .subcommand(
            Command::new("fetch")
                .about("Download and verify a formula's source and bottle")
                .arg(formula_arg()),
        )
        .subcommand(
            Command::new("bottle")
                .about("Pack an installed formula into a bottle archive")
                .arg(formula_arg())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("DIR")
                        .default_value(".")
                        .help("Directory to write the archive to"),
                ),
        )
        .subcommand(
            Command::new("list").about("List installed formulas").arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print as JSON"),
            ),
        )
        .subcommand(
            Command::new("cache")
                .about("Manage the artifact cache")
                .subcommand_required(true)
                .subcommand(
                    Command::new("clear")
                        .about("Remove every installed artifact and cached download"),
                ),
        )
        .after_help(
            "EXIT STATUS:\n  0 success, 1 other error, 2 resolution error, 3 build error,\n  4 checksum mismatch, 5 test failure, 130 interrupted",
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("formulary.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
