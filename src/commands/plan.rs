// src/commands/plan.rs

//! Plan command - show what an install would do

use super::Context;
use anyhow::Result;
use formulary::recipe::BottleSelector;
use formulary::{ResolveOptions, Resolver};

pub fn cmd_plan(ctx: &Context, names: &[String], with_tests: bool, json: bool) -> Result<i32> {
    let formulas = ctx.load_formulas()?;
    let targets: Vec<&str> = names.iter().map(String::as_str).collect();
    let plan = Resolver::new(&formulas, &ctx.platform)
        .resolve(&targets, ResolveOptions { with_tests })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan.to_json())?);
        return Ok(0);
    }

    let selector = if ctx.config.build_from_source {
        BottleSelector::disabled(ctx.platform.clone())
    } else {
        BottleSelector::new(ctx.platform.clone())
    };

    println!("Build plan for {} on {}:", plan.targets().join(", "), plan.platform_key());
    for (index, entry) in plan.entries().iter().enumerate() {
        let formula = entry.formula();
        let how = if selector.select(formula).is_some() {
            "bottle"
        } else {
            "source"
        };
        let mut notes = Vec::new();
        if entry.is_requested() {
            notes.push("requested");
        }
        if entry.is_ephemeral() {
            notes.push("build only");
        }
        println!(
            "  {:>3}. {} {} [{}]{}",
            index + 1,
            entry.name(),
            formula.version_dir(),
            how,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" ({})", notes.join(", "))
            }
        );
        let deps: Vec<&str> = entry.dependencies().iter().map(|d| d.name.as_str()).collect();
        if !deps.is_empty() {
            println!("       needs: {}", deps.join(", "));
        }
    }
    Ok(0)
}
