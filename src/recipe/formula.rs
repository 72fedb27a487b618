// src/recipe/formula.rs

//! Validated, immutable formulas
//!
//! [`Formula::from_recipe`] is the only way to obtain a [`Formula`]; every
//! structural rule a recipe must satisfy is checked there and reported as
//! [`Error::InvalidRecipe`] naming the offending field.

use crate::error::{Error, Result};
use crate::hash::{Checksum, HashAlgorithm};
use crate::platform::{Platform, PlatformGate};
use crate::recipe::bottle::{BottleManifest, version_dir};
use crate::recipe::format::{BuildStep, DependencyKind, Recipe, TestStep};
use crate::recipe::license::License;
use crate::recipe::patch::Patch;
use crate::recipe::placeholder::{self, Scope};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// A dependency edge with its kinds and platform gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    name: String,
    kinds: BTreeSet<DependencyKind>,
    gate: PlatformGate,
}

impl Dependency {
    pub fn new(name: impl Into<String>, kinds: &[DependencyKind], gate: PlatformGate) -> Self {
        let mut kinds: BTreeSet<DependencyKind> = kinds.iter().copied().collect();
        if kinds.is_empty() {
            kinds.insert(DependencyKind::Runtime);
        }
        Self {
            name: name.into(),
            kinds,
            gate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kinds(&self) -> &BTreeSet<DependencyKind> {
        &self.kinds
    }

    pub fn gate(&self) -> &PlatformGate {
        &self.gate
    }

    pub fn has_kind(&self, kind: DependencyKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn is_runtime(&self) -> bool {
        self.has_kind(DependencyKind::Runtime)
    }

    /// Build or runtime: injected into the build environment
    pub fn needed_for_build(&self) -> bool {
        self.has_kind(DependencyKind::Build) || self.is_runtime()
    }

    /// Only a test dependency
    pub fn is_test_only(&self) -> bool {
        self.kinds.len() == 1 && self.has_kind(DependencyKind::Test)
    }

    pub fn applies_to(&self, platform: &Platform) -> bool {
        platform.satisfies(&self.gate)
    }
}

/// One validated formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    name: String,
    version: String,
    revision: u32,
    description: Option<String>,
    homepage: Option<String>,
    license: License,
    source_url: String,
    checksum: Checksum,
    requirements: PlatformGate,
    dependencies: Vec<Dependency>,
    build_steps: Vec<BuildStep>,
    patch: Option<Patch>,
    tests: Vec<TestStep>,
    bottle: BottleManifest,
}

impl Formula {
    /// Validate a parsed recipe
    pub fn from_recipe(recipe: &Recipe) -> Result<Self> {
        let meta = &recipe.formula;
        let name = meta.name.trim().to_string();
        let label = if name.is_empty() { "<unnamed>" } else { name.as_str() };
        let invalid = |field: &str, reason: &str| Error::invalid_recipe(label, field, reason);

        if name.is_empty() {
            return Err(invalid("formula.name", "name cannot be empty"));
        }
        if name.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(invalid(
                "formula.name",
                "name cannot contain whitespace or '/'",
            ));
        }
        let version = meta.version.trim().to_string();
        if version.is_empty() {
            return Err(invalid("formula.version", "version cannot be empty"));
        }

        let license = meta
            .license
            .clone()
            .ok_or_else(|| invalid("formula.license", "missing license"))?;
        license
            .validate()
            .map_err(|reason| invalid("formula.license", &reason))?;

        if recipe.source.url.trim().is_empty() {
            return Err(invalid("source.url", "source URL cannot be empty"));
        }
        let checksum_text = recipe
            .source
            .checksum
            .as_deref()
            .ok_or_else(|| invalid("source.checksum", "missing checksum"))?;
        let checksum = Checksum::parse(checksum_text)
            .map_err(|e| invalid("source.checksum", &e.to_string()))?;
        if checksum.algorithm() != HashAlgorithm::Sha256 {
            return Err(invalid(
                "source.checksum",
                "only sha256 checksums are accepted for sources",
            ));
        }

        let mut dependencies = Vec::with_capacity(recipe.dependencies.len());
        let mut seen = HashSet::new();
        for spec in &recipe.dependencies {
            let dep_name = spec.name.trim();
            let field = format!("dependencies.{dep_name}");
            if dep_name.is_empty() {
                return Err(invalid("dependencies", "dependency name cannot be empty"));
            }
            if dep_name == name {
                return Err(invalid(&field, "formula depends on itself"));
            }
            if !seen.insert(dep_name.to_string()) {
                return Err(invalid(&field, "duplicate dependency"));
            }
            dependencies.push(Dependency::new(dep_name, &spec.kind, spec.platform.clone()));
        }
        let dep_names: Vec<&str> = dependencies.iter().map(Dependency::name).collect();

        for (i, step) in recipe.build.iter().enumerate() {
            check_build_step(step, i, &dep_names)
                .map_err(|(field, reason)| invalid(&field, &reason))?;
        }

        let patch = match &recipe.patch {
            Some(section) if section.diff.trim().is_empty() => {
                return Err(invalid("patch.diff", "empty patch"));
            }
            Some(section) => Some(
                Patch::parse(&section.diff, section.strip, section.directory.clone())
                    .map_err(|e| invalid("patch.diff", &e.to_string()))?,
            ),
            None => None,
        };

        for (i, step) in recipe.test.iter().enumerate() {
            check_test_step(step, i, &dep_names)
                .map_err(|(field, reason)| invalid(&field, &reason))?;
        }

        let bottle = match &recipe.bottle {
            Some(section) => BottleManifest::from_section(section)
                .map_err(|(field, reason)| invalid(&field, &reason))?,
            None => BottleManifest::default(),
        };

        Ok(Self {
            name,
            version,
            revision: meta.revision,
            description: meta.description.clone(),
            homepage: meta.homepage.clone(),
            license,
            source_url: recipe.source.url.trim().to_string(),
            checksum,
            requirements: recipe.requirements.clone(),
            dependencies,
            build_steps: recipe.build.clone(),
            patch,
            tests: recipe.test.clone(),
            bottle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// `{version}` or `{version}_{revision}`, used for prefixes and bottles
    pub fn version_dir(&self) -> String {
        version_dir(&self.version, self.revision)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn homepage(&self) -> Option<&str> {
        self.homepage.as_deref()
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn requirements(&self) -> &PlatformGate {
        &self.requirements
    }

    pub fn supports(&self, platform: &Platform) -> bool {
        platform.satisfies(&self.requirements)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn dependency(&self, name: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    pub fn build_steps(&self) -> &[BuildStep] {
        &self.build_steps
    }

    pub fn patch(&self) -> Option<&Patch> {
        self.patch.as_ref()
    }

    pub fn tests(&self) -> &[TestStep] {
        &self.tests
    }

    pub fn bottle(&self) -> &BottleManifest {
        &self.bottle
    }

    /// Archive file name of the source, from the URL's last path segment
    pub fn source_filename(&self) -> String {
        self.source_url
            .split(['?', '#'])
            .next()
            .and_then(|url| url.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}.tar.gz", self.name, self.version))
    }
}

type FieldError = (String, String);

fn check_template(
    template: &str,
    field: String,
    scope: Scope,
    deps: &[&str],
    whole_arg: bool,
) -> std::result::Result<(), FieldError> {
    placeholder::check(template, scope, deps, whole_arg).map_err(|reason| (field, reason))
}

fn check_build_step(
    step: &BuildStep,
    i: usize,
    deps: &[&str],
) -> std::result::Result<(), FieldError> {
    match step {
        BuildStep::Run {
            program,
            args,
            env,
            workdir,
        } => {
            if program.trim().is_empty() {
                return Err((format!("build[{i}].program"), "empty program".to_string()));
            }
            check_template(program, format!("build[{i}].program"), Scope::Build, deps, false)?;
            for (j, arg) in args.iter().enumerate() {
                check_template(arg, format!("build[{i}].args[{j}]"), Scope::Build, deps, true)?;
            }
            check_env(env, &format!("build[{i}]"), Scope::Build, deps)?;
            if let Some(dir) = workdir {
                check_template(dir, format!("build[{i}].workdir"), Scope::Build, deps, false)?;
            }
        }
        BuildStep::InstallFile { from, to, .. } => {
            if from.trim().is_empty() || to.trim().is_empty() {
                return Err((
                    format!("build[{i}]"),
                    "install_file needs both 'from' and 'to'".to_string(),
                ));
            }
            check_template(from, format!("build[{i}].from"), Scope::Build, deps, false)?;
            check_template(to, format!("build[{i}].to"), Scope::Build, deps, false)?;
        }
        BuildStep::Mkdir { path } => {
            if path.trim().is_empty() {
                return Err((format!("build[{i}].path"), "empty path".to_string()));
            }
            check_template(path, format!("build[{i}].path"), Scope::Build, deps, false)?;
        }
    }
    Ok(())
}

fn check_test_step(
    step: &TestStep,
    i: usize,
    deps: &[&str],
) -> std::result::Result<(), FieldError> {
    if step.program().trim().is_empty() {
        return Err((format!("test[{i}].program"), "empty program".to_string()));
    }
    check_template(step.program(), format!("test[{i}].program"), Scope::Test, deps, false)?;
    for (j, arg) in step.args().iter().enumerate() {
        check_template(arg, format!("test[{i}].args[{j}]"), Scope::Test, deps, true)?;
    }
    check_env(step.env(), &format!("test[{i}]"), Scope::Test, deps)?;

    if let TestStep::AssertOutput {
        contains, matches, ..
    } = step
    {
        if contains.is_none() && matches.is_none() {
            return Err((
                format!("test[{i}]"),
                "assert_output needs 'contains' or 'matches'".to_string(),
            ));
        }
        if let Some(literal) = contains {
            check_template(literal, format!("test[{i}].contains"), Scope::Test, deps, false)?;
        }
        if let Some(pattern) = matches {
            regex::Regex::new(pattern)
                .map_err(|e| (format!("test[{i}].matches"), e.to_string()))?;
        }
    }
    Ok(())
}

fn check_env(
    env: &BTreeMap<String, String>,
    prefix: &str,
    scope: Scope,
    deps: &[&str],
) -> std::result::Result<(), FieldError> {
    for (key, value) in env {
        if key.is_empty() || key.contains('=') {
            return Err((format!("{prefix}.env"), format!("invalid variable name '{key}'")));
        }
        check_template(value, format!("{prefix}.env.{key}"), scope, deps, false)?;
    }
    Ok(())
}

/// Every known formula, by name
#[derive(Debug, Clone, Default)]
pub struct FormulaSet {
    formulas: BTreeMap<String, Arc<Formula>>,
}

impl FormulaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Result<Self> {
        let mut set = Self::new();
        for formula in formulas {
            set.insert(formula)?;
        }
        Ok(set)
    }

    /// Add a formula; names must be unique
    pub fn insert(&mut self, formula: Formula) -> Result<()> {
        if self.formulas.contains_key(formula.name()) {
            return Err(Error::invalid_recipe(
                formula.name(),
                "formula.name",
                "formula is defined more than once",
            ));
        }
        self.formulas
            .insert(formula.name().to_string(), Arc::new(formula));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Formula>> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Formula>> {
        self.formulas.values()
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}
