// src/recipe/placeholder.rs

//! Placeholder substitution for build and test steps
//!
//! Arguments may reference install paths with `{name}`-style placeholders:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{name}`, `{version}` | formula identity |
//! | `{prefix}` | final install prefix |
//! | `{bin}`, `{sbin}`, `{lib}`, `{libexec}`, `{include}`, `{share}`, `{etc}` | prefix sub-directories |
//! | `{jobs}` | parallel job count |
//! | `{buildpath}` | source root (build steps only) |
//! | `{testpath}` | scratch directory (test steps only) |
//! | `{dep:<name>}` | prefix of a declared dependency |
//!
//! An argument consisting of exactly `{@std_configure_args}`,
//! `{@std_go_args}`, `{@std_cmake_args}` or `{@std_pip_args}` expands to
//! several arguments. `{{` and `}}` produce literal braces.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where a template is used; decides which placeholders are in scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Build,
    Test,
}

const PATH_PLACEHOLDERS: &[(&str, &str)] = &[
    ("bin", "bin"),
    ("sbin", "sbin"),
    ("lib", "lib"),
    ("libexec", "libexec"),
    ("include", "include"),
    ("share", "share"),
    ("etc", "etc"),
];

const LIST_EXPANSIONS: &[&str] = &[
    "std_configure_args",
    "std_go_args",
    "std_cmake_args",
    "std_pip_args",
];

/// A piece of a parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Literal(String),
    Placeholder(&'a str),
}

fn tokenize(template: &str) -> std::result::Result<Vec<Token<'_>>, String> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(c) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("{{") {
            literal.push('{');
            rest = after;
        } else if let Some(after) = rest.strip_prefix("}}") {
            literal.push('}');
            rest = after;
        } else if c == '{' {
            let end = rest
                .find('}')
                .ok_or_else(|| format!("unterminated placeholder in '{template}'"))?;
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(&mut literal)));
            }
            tokens.push(Token::Placeholder(&rest[1..end]));
            rest = &rest[end + 1..];
        } else {
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// Check a template at validation time
///
/// `deps` holds the declared dependency names; `whole_arg` allows the
/// `{@...}` list expansions (only meaningful as a complete argument).
pub fn check(
    template: &str,
    scope: Scope,
    deps: &[&str],
    whole_arg: bool,
) -> std::result::Result<(), String> {
    let tokens = tokenize(template)?;
    let single = tokens.len() == 1;
    for token in tokens {
        let Token::Placeholder(name) = token else {
            continue;
        };
        if let Some(list) = name.strip_prefix('@') {
            if !LIST_EXPANSIONS.contains(&list) {
                return Err(format!("unknown list expansion '{{{name}}}'"));
            }
            if !(whole_arg && single) {
                return Err(format!("'{{{name}}}' must be a complete argument"));
            }
            continue;
        }
        if let Some(dep) = name.strip_prefix("dep:") {
            if !deps.contains(&dep) {
                return Err(format!("'{{{name}}}' references undeclared dependency '{dep}'"));
            }
            continue;
        }
        match name {
            "name" | "version" | "prefix" | "jobs" => {}
            "buildpath" if scope == Scope::Build => {}
            "testpath" if scope == Scope::Test => {}
            "buildpath" | "testpath" => {
                return Err(format!("'{{{name}}}' is not available in this step"));
            }
            other if PATH_PLACEHOLDERS.iter().any(|(p, _)| *p == other) => {}
            other => return Err(format!("unknown placeholder '{{{other}}}'")),
        }
    }
    Ok(())
}

/// Values placeholders expand to for one formula
#[derive(Debug, Clone)]
pub struct Substitutions {
    name: String,
    version: String,
    prefix: PathBuf,
    jobs: usize,
    buildpath: Option<PathBuf>,
    testpath: Option<PathBuf>,
    deps: BTreeMap<String, PathBuf>,
}

impl Substitutions {
    pub fn new(name: &str, version: &str, prefix: &Path, jobs: usize) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            prefix: prefix.to_path_buf(),
            jobs,
            buildpath: None,
            testpath: None,
            deps: BTreeMap::new(),
        }
    }

    pub fn with_buildpath(mut self, path: &Path) -> Self {
        self.buildpath = Some(path.to_path_buf());
        self
    }

    pub fn with_testpath(mut self, path: &Path) -> Self {
        self.testpath = Some(path.to_path_buf());
        self
    }

    pub fn with_dependency(mut self, name: &str, prefix: &Path) -> Self {
        self.deps.insert(name.to_string(), prefix.to_path_buf());
        self
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(dep) = name.strip_prefix("dep:") {
            return self.deps.get(dep).map(|p| p.display().to_string());
        }
        match name {
            "name" => Some(self.name.clone()),
            "version" => Some(self.version.clone()),
            "prefix" => Some(self.prefix.display().to_string()),
            "jobs" => Some(self.jobs.to_string()),
            "buildpath" => self.buildpath.as_ref().map(|p| p.display().to_string()),
            "testpath" => self.testpath.as_ref().map(|p| p.display().to_string()),
            other => PATH_PLACEHOLDERS
                .iter()
                .find(|(p, _)| *p == other)
                .map(|(_, dir)| self.prefix.join(dir).display().to_string()),
        }
    }

    /// Expand a single template string
    pub fn expand(&self, template: &str) -> Result<String> {
        let tokens = tokenize(template).map_err(|reason| self.invalid(template, reason))?;
        let mut out = String::new();
        for token in tokens {
            match token {
                Token::Literal(text) => out.push_str(&text),
                Token::Placeholder(name) => {
                    let value = self.lookup(name).ok_or_else(|| {
                        self.invalid(template, format!("cannot expand '{{{name}}}'"))
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }

    /// Expand an argument list, splicing `{@...}` list expansions
    pub fn expand_args(&self, args: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match arg
                .strip_prefix("{@")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(list) => out.extend(self.list_expansion(list, arg)?),
                None => out.push(self.expand(arg)?),
            }
        }
        Ok(out)
    }

    fn list_expansion(&self, list: &str, arg: &str) -> Result<Vec<String>> {
        let prefix = self.prefix.display();
        let args = match list {
            "std_configure_args" => vec![
                "--disable-debug".to_string(),
                "--disable-dependency-tracking".to_string(),
                format!("--prefix={prefix}"),
                format!("--libdir={}", self.prefix.join("lib").display()),
            ],
            "std_go_args" => vec![
                "-trimpath".to_string(),
                "-o".to_string(),
                self.prefix.join("bin").join(&self.name).display().to_string(),
            ],
            "std_cmake_args" => vec![
                format!("-DCMAKE_INSTALL_PREFIX={prefix}"),
                "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
                "-DCMAKE_BUILD_TYPE=Release".to_string(),
                "-DCMAKE_VERBOSE_MAKEFILE=ON".to_string(),
                "-DBUILD_TESTING=OFF".to_string(),
                "-Wno-dev".to_string(),
            ],
            "std_pip_args" => vec![
                "--verbose".to_string(),
                "--no-deps".to_string(),
                "--no-binary=:all:".to_string(),
                "--ignore-installed".to_string(),
                "--no-compile".to_string(),
                format!("--prefix={prefix}"),
            ],
            _ => return Err(self.invalid(arg, format!("unknown list expansion '{arg}'"))),
        };
        Ok(args)
    }

    fn invalid(&self, template: &str, reason: String) -> Error {
        Error::invalid_recipe(&self.name, format!("template '{template}'"), reason)
    }
}
