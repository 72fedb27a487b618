// src/commands/cache.rs

//! Cache maintenance commands

use super::Context;
use anyhow::Result;

pub fn cmd_cache_clear(ctx: &Context) -> Result<i32> {
    let cache = ctx.open_cache()?;
    let removed = cache.clear()?;
    println!(
        "[OK] Removed {} installed formula(s) and cached downloads from {}",
        removed,
        cache.layout().root().display()
    );
    Ok(0)
}
