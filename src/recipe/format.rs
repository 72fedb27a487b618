// src/recipe/format.rs

//! Recipe file format definitions
//!
//! Recipes are TOML files with a closed schema: every build and test step is
//! one of a fixed set of tagged variants, and platform restrictions are
//! explicit predicates rather than conditionals. These structs mirror the file
//! one-to-one; [`crate::recipe::Formula`] is the validated form.

use crate::platform::PlatformGate;
use crate::recipe::license::License;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A complete recipe file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    /// Identity and metadata
    pub formula: FormulaSection,

    /// Source archive and its checksum
    pub source: SourceSection,

    /// Platforms the formula can be installed on (empty = all)
    #[serde(default)]
    pub requirements: PlatformGate,

    /// Declared dependencies
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    /// Embedded patch applied before any build step
    #[serde(default)]
    pub patch: Option<PatchSection>,

    /// Ordered build steps
    #[serde(default)]
    pub build: Vec<BuildStep>,

    /// Post-install verification steps
    #[serde(default)]
    pub test: Vec<TestStep>,

    /// Prebuilt artifacts per platform
    #[serde(default)]
    pub bottle: Option<BottleSection>,
}

/// `[formula]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormulaSection {
    pub name: String,

    pub version: String,

    /// Bumped when the recipe changes without a new upstream version
    #[serde(default)]
    pub revision: u32,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    #[serde(default)]
    pub license: Option<License>,
}

/// `[source]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    /// Archive URL (`https://`, `http://`, `file://` or a local path)
    pub url: String,

    /// `sha256:<hex>` or bare SHA-256 hex
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Dependency kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed only while building
    Build,
    /// Needed while the product runs
    Runtime,
    /// Needed only to run the test script
    Test,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Build => "build",
            DependencyKind::Runtime => "runtime",
            DependencyKind::Test => "test",
        }
    }
}

/// `[[dependencies]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
    pub name: String,

    /// Kinds; an empty list means `runtime`
    #[serde(default)]
    pub kind: Vec<DependencyKind>,

    /// Only applies on matching platforms
    #[serde(default)]
    pub platform: PlatformGate,
}

/// `[patch]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchSection {
    /// Unified diff text, possibly touching several files
    pub diff: String,

    /// Leading path components to strip (as `patch -p1`)
    #[serde(default = "default_strip")]
    pub strip: usize,

    /// Sub-directory of the source root the paths are relative to
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_strip() -> usize {
    1
}

/// `[[build]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case", deny_unknown_fields)]
pub enum BuildStep {
    /// Run a program with arguments
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        /// Relative to the source root
        #[serde(default)]
        workdir: Option<String>,
    },

    /// Copy a file from the build tree into the prefix
    InstallFile {
        /// Relative to the source root
        from: String,
        /// Destination, usually starting with a placeholder such as `{share}`
        to: String,
        #[serde(default)]
        mode: Option<u32>,
    },

    /// Create a directory (and parents)
    Mkdir { path: String },
}

impl BuildStep {
    /// Short human-readable rendering for logs and errors
    pub fn describe(&self) -> String {
        match self {
            BuildStep::Run { program, args, .. } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
            BuildStep::InstallFile { from, to, .. } => format!("install {from} => {to}"),
            BuildStep::Mkdir { path } => format!("mkdir {path}"),
        }
    }
}

/// `[[test]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case", deny_unknown_fields)]
pub enum TestStep {
    /// The program must exit 0
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        description: Option<String>,
    },

    /// The program's combined output must contain a literal or match a regex
    AssertOutput {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        contains: Option<String>,
        #[serde(default)]
        matches: Option<String>,
        #[serde(default)]
        exit_code: i32,
        #[serde(default)]
        description: Option<String>,
    },
}

impl TestStep {
    pub fn program(&self) -> &str {
        match self {
            TestStep::Run { program, .. } | TestStep::AssertOutput { program, .. } => program,
        }
    }

    pub fn args(&self) -> &[String] {
        match self {
            TestStep::Run { args, .. } | TestStep::AssertOutput { args, .. } => args,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        match self {
            TestStep::Run { env, .. } | TestStep::AssertOutput { env, .. } => env,
        }
    }

    /// Declared description, or the command line
    pub fn describe(&self) -> String {
        let declared = match self {
            TestStep::Run { description, .. } | TestStep::AssertOutput { description, .. } => {
                description.as_deref()
            }
        };
        match declared {
            Some(d) => d.to_string(),
            None if self.args().is_empty() => self.program().to_string(),
            None => format!("{} {}", self.program(), self.args().join(" ")),
        }
    }
}

/// `[bottle]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BottleSection {
    /// Base URL for bottle archives; defaults to `<source origin>/bottles`
    #[serde(default)]
    pub root_url: Option<String>,

    /// Platform key to bottle checksum
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[formula]
name = "hello"
version = "2.12"
license = "GPL-3.0-or-later"

[source]
url = "https://example.com/hello-2.12.tar.gz"
checksum = "sha256:cf04af86dc085268c5f4470fbae49b18afbc221b78096aab842d934a76bad0ab"
"#;

    #[test]
    fn test_minimal_recipe() {
        let recipe: Recipe = toml::from_str(MINIMAL).unwrap();
        assert_eq!(recipe.formula.name, "hello");
        assert_eq!(recipe.formula.revision, 0);
        assert!(recipe.dependencies.is_empty());
        assert!(recipe.build.is_empty());
        assert!(recipe.patch.is_none());
        assert!(recipe.requirements.is_unrestricted());
    }

    #[test]
    fn test_tagged_steps() {
        let text = format!(
            r#"{MINIMAL}
[[build]]
step = "run"
program = "./configure"
args = ["{{@std_configure_args}}"]

[[build]]
step = "install_file"
from = "btrfs-completion"
to = "{{share}}/bash-completion/completions/btrfs"

[[build]]
step = "mkdir"
path = "{{etc}}"

[[test]]
step = "assert_output"
program = "{{bin}}/hello"
args = ["--version"]
contains = "2.12"
"#
        );
        let recipe: Recipe = toml::from_str(&text).unwrap();
        assert_eq!(recipe.build.len(), 3);
        assert!(matches!(recipe.build[1], BuildStep::InstallFile { .. }));
        assert_eq!(recipe.build[0].describe(), "./configure {@std_configure_args}");
        match &recipe.test[0] {
            TestStep::AssertOutput {
                contains, exit_code, ..
            } => {
                assert_eq!(contains.as_deref(), Some("2.12"));
                assert_eq!(*exit_code, 0);
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(recipe.test[0].describe(), "{bin}/hello --version");
    }

    #[test]
    fn test_dependency_kinds() {
        let text = format!(
            r#"{MINIMAL}
[[dependencies]]
name = "python@3.13"
kind = ["build", "test"]

[[dependencies]]
name = "zlib"

[[dependencies]]
name = "systemd"
platform = {{ os = ["linux"] }}
"#
        );
        let recipe: Recipe = toml::from_str(&text).unwrap();
        assert_eq!(
            recipe.dependencies[0].kind,
            vec![DependencyKind::Build, DependencyKind::Test]
        );
        assert!(recipe.dependencies[1].kind.is_empty());
        assert_eq!(recipe.dependencies[2].platform.os, vec!["linux"]);
    }

    #[test]
    fn test_unknown_step_rejected() {
        let text = format!(
            r#"{MINIMAL}
[[build]]
step = "shell"
script = "curl | sh"
"#
        );
        assert!(toml::from_str::<Recipe>(&text).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let text = MINIMAL.replace("[source]", "[source]\nmirror = \"x\"");
        assert!(toml::from_str::<Recipe>(&text).is_err());
    }
}
