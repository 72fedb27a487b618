// src/commands/install.rs

//! Install command - resolve, pour or build, and test formulas

use super::Context;
use anyhow::Result;
use formulary::recipe::kitchen::install_interrupt_handler;
use formulary::recipe::{CookOutcome, InstallKind, RunReport};
use formulary::{Error, ResolveOptions, Resolver, Scheduler};
use tracing::info;

/// Install formulas and everything they depend on
pub fn cmd_install(ctx: &Context, names: &[String]) -> Result<i32> {
    let formulas = ctx.load_formulas()?;
    let targets: Vec<&str> = names.iter().map(String::as_str).collect();
    let plan = Resolver::new(&formulas, &ctx.platform).resolve(
        &targets,
        ResolveOptions {
            with_tests: ctx.config.run_tests,
        },
    )?;

    let pulled_in = plan.len() - plan.targets().len();
    println!(
        "==> Installing {} on {} ({} dependenc{})",
        plan.targets().join(", "),
        plan.platform_key(),
        pulled_in,
        if pulled_in == 1 { "y" } else { "ies" }
    );
    for entry in plan.entries() {
        info!(
            "Plan: {} {}{}",
            entry.name(),
            entry.formula().version(),
            if entry.is_ephemeral() { " (build only)" } else { "" }
        );
    }

    let kitchen = ctx.kitchen()?;
    install_interrupt_handler(kitchen.cancel_token().clone())?;
    let report = Scheduler::new(&kitchen).run(&plan)?;

    print_summary(&report);
    Ok(report.error_class().map(|c| c.exit_code()).unwrap_or(0))
}

/// Per-formula summary; skips are reported once per root cause
pub fn print_summary(report: &RunReport) {
    println!();
    for result in &report.results {
        match &result.outcome {
            CookOutcome::Installed {
                kind,
                prefix,
                test_failures,
            } => {
                let how = match kind {
                    InstallKind::Cached => "already installed",
                    InstallKind::Bottle => "poured from bottle",
                    InstallKind::Built => "built from source",
                };
                if test_failures.is_empty() {
                    println!("[OK]      {} ({}) {}", result.name, how, prefix.display());
                } else {
                    println!("[WARN]    {} ({}) {}", result.name, how, prefix.display());
                    for failure in test_failures {
                        println!("          {}", failure);
                    }
                }
            }
            CookOutcome::Failed { stage, error } => {
                if matches!(error, Error::Cancelled) {
                    println!("[FAILED]  {} (cancelled while {})", result.name, stage);
                } else {
                    println!(
                        "[FAILED]  {} while {} [{}]: {}",
                        result.name,
                        stage,
                        error.class().as_str(),
                        error
                    );
                }
                if let Error::BuildStepFailed { stderr, .. } = error {
                    for line in stderr.lines() {
                        println!("          | {}", line);
                    }
                }
            }
            CookOutcome::Skipped { .. } => {}
        }
    }

    for (cause, skipped) in report.skipped_by_root_cause() {
        if cause == "cancelled" {
            println!("[SKIPPED] {} (run cancelled)", skipped.join(", "));
        } else {
            let reason = Error::DependencyFailed {
                dependency: cause.to_string(),
            };
            println!("[SKIPPED] {} ({})", skipped.join(", "), reason);
        }
    }

    let installed = report
        .results
        .iter()
        .filter(|r| r.outcome.is_installed())
        .count();
    let total = report.results.len();
    if installed == total {
        println!("\n[COMPLETE] {} formula(s) installed", total);
    } else {
        println!("\n[PARTIAL] {} of {} formula(s) installed", installed, total);
    }
}
