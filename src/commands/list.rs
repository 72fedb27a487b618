// src/commands/list.rs

//! List command - show installed formulas

use super::Context;
use anyhow::Result;

pub fn cmd_list(ctx: &Context, json: bool) -> Result<i32> {
    let cache = ctx.open_cache()?;
    let artifacts = cache.list()?;

    if json {
        let rows: Vec<serde_json::Value> = artifacts
            .iter()
            .map(|a| {
                serde_json::json!({
                    "name": a.name,
                    "version": a.version,
                    "revision": a.revision,
                    "platform": a.platform_key,
                    "prefix": a.prefix,
                    "source": a.source.as_str(),
                    "checksum": a.checksum,
                    "runtime_dependencies": a.runtime_dependencies,
                    "files": a.files.len(),
                    "installed_at": a.installed_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    if artifacts.is_empty() {
        println!("No formulas installed.");
        return Ok(0);
    }

    println!(
        "{:<24} {:<14} {:<16} {:<7} {}",
        "NAME", "VERSION", "PLATFORM", "FROM", "INSTALLED"
    );
    for a in &artifacts {
        let version = if a.revision > 0 {
            format!("{}_{}", a.version, a.revision)
        } else {
            a.version.clone()
        };
        println!(
            "{:<24} {:<14} {:<16} {:<7} {}",
            a.name,
            version,
            a.platform_key,
            a.source.as_str(),
            a.installed_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} formula(s) installed", artifacts.len());
    Ok(0)
}
