// src/main.rs

use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod commands;

use cli::{CacheCommands, Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.global.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let ctx = commands::Context::from_args(&cli.global)?;
    debug!(
        "Platform {}, root {}, {} job(s)",
        ctx.platform.key(),
        ctx.config.root.display(),
        ctx.config.jobs
    );

    match cli.command {
        Commands::Install { formulas } => commands::cmd_install(&ctx, &formulas),
        Commands::Test { formula } => commands::cmd_test(&ctx, &formula),
        Commands::Plan {
            formulas,
            with_tests,
            json,
        } => commands::cmd_plan(&ctx, &formulas, with_tests, json),
        Commands::Fetch { formula } => commands::cmd_fetch(&ctx, &formula),
        Commands::Bottle { formula, output } => commands::cmd_bottle(&ctx, &formula, &output),
        Commands::List { json } => commands::cmd_list(&ctx, json),
        Commands::Cache { command } => match command {
            CacheCommands::Clear => commands::cmd_cache_clear(&ctx),
        },
    }
}

/// Map an error that escaped a command to the process exit code
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<formulary::Error>())
        .map(|e| e.class().exit_code())
        .unwrap_or(1)
}
