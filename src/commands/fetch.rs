// src/commands/fetch.rs

//! Fetch command - download and verify without installing

use super::Context;
use anyhow::{Context as _, Result};
use formulary::Error;
use formulary::recipe::BottleSelector;

pub fn cmd_fetch(ctx: &Context, name: &str) -> Result<i32> {
    let formulas = ctx.load_formulas()?;
    let formula = formulas
        .get(name)
        .ok_or_else(|| Error::UnknownFormula {
            name: name.to_string(),
            required_by: None,
        })?;
    let kitchen = ctx.kitchen()?;

    let source = kitchen
        .fetch_source(formula)
        .with_context(|| format!("Failed to fetch source for {}", name))?;
    println!("[OK] {} source: {}", name, source.display());

    if !ctx.config.build_from_source {
        if let Some(choice) = BottleSelector::new(ctx.platform.clone()).select(formula) {
            let bytes = kitchen
                .fetch_bottle(formula, &choice)
                .with_context(|| format!("Failed to fetch bottle for {}", name))?;
            println!(
                "[OK] {} bottle ({}): {} bytes",
                name,
                choice.platform_key,
                bytes.len()
            );
        }
    }
    Ok(0)
}
