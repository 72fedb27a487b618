// src/recipe/parser.rs

//! Recipe file parsing and discovery

use crate::error::{Error, Result};
use crate::recipe::format::{BuildStep, Recipe};
use crate::recipe::formula::{Formula, FormulaSet};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Parse a recipe from a TOML string without validating it
pub fn parse_recipe(content: &str) -> Result<Recipe> {
    parse_recipe_named(content, "<inline>")
}

fn parse_recipe_named(content: &str, origin: &str) -> Result<Recipe> {
    toml::from_str(content)
        .map_err(|e| Error::invalid_recipe(origin, "syntax", e.message().to_string()))
}

/// Validate a recipe, returning non-fatal warnings
pub fn validate_recipe(recipe: &Recipe) -> Result<Vec<String>> {
    let formula = Formula::from_recipe(recipe)?;
    Ok(collect_warnings(&formula, recipe))
}

fn collect_warnings(formula: &Formula, recipe: &Recipe) -> Vec<String> {
    let mut warnings = Vec::new();

    if formula.description().is_none() {
        warnings.push("Missing formula description".to_string());
    }
    if formula.homepage().is_none() {
        warnings.push("Missing formula homepage".to_string());
    }
    if formula.tests().is_empty() {
        warnings.push("No test steps specified".to_string());
    }
    if formula.build_steps().is_empty() {
        warnings.push("No build steps specified".to_string());
    }
    if formula.source_url().starts_with("http://") {
        warnings.push(format!(
            "Source {} is fetched over plain HTTP",
            formula.source_url()
        ));
    }
    if !recipe
        .build
        .iter()
        .any(|step| matches!(step, BuildStep::Run { .. }))
        && !recipe.build.is_empty()
    {
        warnings.push("Build steps never run a program".to_string());
    }

    for unknown in formula.requirements().unknown_entries() {
        warnings.push(format!("Unknown platform '{unknown}' in requirements"));
    }
    for dep in formula.dependencies() {
        for unknown in dep.gate().unknown_entries() {
            warnings.push(format!(
                "Unknown platform '{}' in gate of dependency {}",
                unknown,
                dep.name()
            ));
        }
    }

    warnings
}

/// Parse and validate a formula from a TOML string
pub fn parse_formula(content: &str) -> Result<Formula> {
    let recipe = parse_recipe(content)?;
    build_formula(&recipe)
}

/// Parse and validate a formula from a file
pub fn parse_formula_file(path: &Path) -> Result<Formula> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::IoError(format!(
            "Failed to read recipe file {}: {}",
            path.display(),
            e
        ))
    })?;
    let origin = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let recipe = parse_recipe_named(&content, &origin)?;
    build_formula(&recipe)
}

fn build_formula(recipe: &Recipe) -> Result<Formula> {
    let formula = Formula::from_recipe(recipe)?;
    for warning in collect_warnings(&formula, recipe) {
        debug!("{}: {}", formula.name(), warning);
    }
    Ok(formula)
}

/// Load every `*.toml` formula below `dir`
pub fn load_formulas(dir: &Path) -> Result<FormulaSet> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!(
            "formula directory {}",
            dir.display()
        )));
    }

    let mut set = FormulaSet::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "toml") {
            continue;
        }
        let formula = parse_formula_file(path)?;
        let stem = path.file_stem().and_then(|s| s.to_str());
        if stem.is_some_and(|stem| stem != formula.name()) {
            warn!(
                "{} defines formula '{}'; file name does not match",
                path.display(),
                formula.name()
            );
        }
        set.insert(formula)?;
    }

    debug!("Loaded {} formulas from {}", set.len(), dir.display());
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const VALID: &str = r#"
[formula]
name = "test"
version = "1.0"
license = "MIT"

[source]
url = "https://example.com/test-1.0.tar.gz"
checksum = "sha256:529c6a58b3b5c5eb3faab07f2bf752155868b912e4f753e432d14040ff4f4262"

[[build]]
step = "run"
program = "make"
args = ["install", "PREFIX={prefix}"]
"#;

    #[test]
    fn test_parse_valid_recipe() {
        let formula = parse_formula(VALID).unwrap();
        assert_eq!(formula.name(), "test");
        assert_eq!(formula.build_steps().len(), 1);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = parse_formula("this is not valid toml at all {}").unwrap_err();
        assert!(matches!(err, Error::InvalidRecipe { ref field, .. } if field == "syntax"));
    }

    #[test]
    fn test_validate_warnings() {
        let recipe = parse_recipe(VALID).unwrap();
        let warnings = validate_recipe(&recipe).unwrap();
        assert!(warnings.iter().any(|w| w.contains("description")));
        assert!(warnings.iter().any(|w| w.contains("test steps")));
    }

    #[test]
    fn test_load_formulas_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("t")).unwrap();
        fs::write(dir.path().join("t/test.toml"), VALID).unwrap();
        fs::write(dir.path().join("README.md"), "not a formula").unwrap();
        fs::write(
            dir.path().join("other.toml"),
            VALID.replace("name = \"test\"", "name = \"other\""),
        )
        .unwrap();

        let set = load_formulas(dir.path()).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["other", "test"]);
    }

    #[test]
    fn test_load_formulas_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), VALID).unwrap();
        fs::write(dir.path().join("b.toml"), VALID).unwrap();
        assert!(matches!(
            load_formulas(dir.path()),
            Err(Error::InvalidRecipe { .. })
        ));
    }

    #[test]
    fn test_file_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[formula\n").unwrap();
        match parse_formula_file(&path).unwrap_err() {
            Error::InvalidRecipe { formula, .. } => assert_eq!(formula, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
