// src/commands/bottle.rs

//! Bottle command - pack an installed prefix for redistribution

use super::Context;
use anyhow::{Context as _, Result};
use formulary::hash::hash_bytes;
use formulary::recipe::ArtifactKey;
use formulary::recipe::bottle::{bottle_filename, pack_bottle};
use formulary::{Error, HashAlgorithm};
use std::fs;
use std::path::Path;

pub fn cmd_bottle(ctx: &Context, name: &str, output: &Path) -> Result<i32> {
    let formulas = ctx.load_formulas()?;
    let formula = formulas.get(name).ok_or_else(|| Error::UnknownFormula {
        name: name.to_string(),
        required_by: None,
    })?;

    let platform_key = ctx.platform.key();
    let cache = ctx.open_cache()?;
    let key = ArtifactKey::new(formula.name(), formula.version(), &platform_key);
    let artifact = cache
        .lookup_current(&key, formula.revision())?
        .ok_or_else(|| Error::NotFound(format!("{} is not installed", key)))?;

    let bytes = pack_bottle(&artifact.prefix, formula.name(), &formula.version_dir())?;
    let filename = bottle_filename(
        formula.name(),
        formula.version(),
        formula.revision(),
        &platform_key,
    );
    fs::create_dir_all(output)?;
    let path = output.join(&filename);
    fs::write(&path, &bytes).with_context(|| format!("Failed to write {}", path.display()))?;

    let checksum = hash_bytes(HashAlgorithm::Sha256, &bytes);

    println!("[OK] Wrote {} ({} bytes)", path.display(), bytes.len());
    println!();
    println!("[bottle.checksums]");
    println!("{} = \"{}\"", platform_key, checksum.to_prefixed_string());
    Ok(0)
}
