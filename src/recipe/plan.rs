// src/recipe/plan.rs

//! Dependency resolution into a build plan
//!
//! The [`Resolver`] walks the dependency edges of the requested formulas
//! depth-first, pruning platform-gated edges that do not apply, and emits
//! every dependency before its dependents. Siblings are visited in
//! alphabetical order so the same request always yields the same plan.

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::recipe::format::DependencyKind;
use crate::recipe::formula::{Formula, FormulaSet};
use crate::recipe::graph::FormulaGraph;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Resolution options
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Also pull in test dependencies of the requested formulas
    pub with_tests: bool,
}

/// A resolved dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDependency {
    pub name: String,
    pub kinds: BTreeSet<DependencyKind>,
}

/// One formula in a build plan
#[derive(Debug, Clone)]
pub struct PlannedFormula {
    formula: Arc<Formula>,
    requested: bool,
    ephemeral: bool,
    dependencies: Vec<PlannedDependency>,
    build_closure: Vec<String>,
    runtime_closure: Vec<String>,
    test_closure: Vec<String>,
}

impl PlannedFormula {
    pub fn formula(&self) -> &Arc<Formula> {
        &self.formula
    }

    pub fn name(&self) -> &str {
        self.formula.name()
    }

    /// Named on the command line (as opposed to pulled in)
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Needed only to build other plan members
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Direct edges kept after platform pruning
    pub fn dependencies(&self) -> &[PlannedDependency] {
        &self.dependencies
    }

    /// Formulas whose prefixes go into the build environment
    pub fn build_closure(&self) -> &[String] {
        &self.build_closure
    }

    /// Formulas the installed artifact needs at run time
    pub fn runtime_closure(&self) -> &[String] {
        &self.runtime_closure
    }

    /// Formulas whose prefixes go into the test environment
    pub fn test_closure(&self) -> &[String] {
        &self.test_closure
    }
}

/// Ordered formulas for one request; dependencies come first
#[derive(Debug, Clone)]
pub struct BuildPlan {
    platform_key: String,
    targets: Vec<String>,
    entries: Vec<PlannedFormula>,
    graph: FormulaGraph,
}

impl BuildPlan {
    pub fn platform_key(&self) -> &str {
        &self.platform_key
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn entries(&self) -> &[PlannedFormula] {
        &self.entries
    }

    pub fn order(&self) -> Vec<&str> {
        self.entries.iter().map(PlannedFormula::name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlannedFormula> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn graph(&self) -> &FormulaGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Machine-readable rendering for `plan --json`
    pub fn to_json(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "name": entry.name(),
                    "version": entry.formula.version(),
                    "revision": entry.formula.revision(),
                    "requested": entry.requested,
                    "ephemeral": entry.ephemeral,
                    "dependencies": entry.dependencies,
                    "build_closure": entry.build_closure,
                    "runtime_closure": entry.runtime_closure,
                    "test_closure": entry.test_closure,
                })
            })
            .collect();
        serde_json::json!({
            "platform": self.platform_key,
            "targets": self.targets,
            "order": entries,
        })
    }
}

/// Resolves requested formulas against a formula set for one platform
pub struct Resolver<'a> {
    formulas: &'a FormulaSet,
    platform: &'a Platform,
}

struct Walk {
    visiting: HashSet<String>,
    visited: HashSet<String>,
    stack: Vec<String>,
    order: Vec<String>,
    edges: BTreeMap<String, Vec<PlannedDependency>>,
}

impl<'a> Resolver<'a> {
    pub fn new(formulas: &'a FormulaSet, platform: &'a Platform) -> Self {
        Self { formulas, platform }
    }

    pub fn resolve(&self, targets: &[&str], options: ResolveOptions) -> Result<BuildPlan> {
        let requested: BTreeSet<String> = targets.iter().map(|t| t.to_string()).collect();
        let mut walk = Walk {
            visiting: HashSet::new(),
            visited: HashSet::new(),
            stack: Vec::new(),
            order: Vec::new(),
            edges: BTreeMap::new(),
        };

        for target in &requested {
            self.visit(target, None, &requested, options, &mut walk)?;
        }

        let mut graph = FormulaGraph::new();
        for name in &walk.order {
            let deps: Vec<&str> = walk.edges[name].iter().map(|d| d.name.as_str()).collect();
            graph.add_formula(name, &deps);
        }

        let runtime: BTreeMap<&str, BTreeSet<String>> = walk
            .order
            .iter()
            .map(|name| (name.as_str(), runtime_reach(name, &walk.edges)))
            .collect();

        let mut needed_at_runtime: BTreeSet<String> = requested.clone();
        for target in &requested {
            needed_at_runtime.extend(runtime[target.as_str()].iter().cloned());
        }

        let position: BTreeMap<&str, usize> = walk
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let ordered = |set: BTreeSet<String>| -> Vec<String> {
            let mut names: Vec<String> = set.into_iter().collect();
            names.sort_by_key(|n| position.get(n.as_str()).copied().unwrap_or(usize::MAX));
            names
        };

        let mut entries = Vec::with_capacity(walk.order.len());
        for name in &walk.order {
            let formula = self.lookup(name, None)?;
            let edges = &walk.edges[name];

            let mut build = BTreeSet::new();
            let mut test = runtime[name.as_str()].clone();
            for dep in edges {
                let reach = &runtime[dep.name.as_str()];
                if dep.kinds.contains(&DependencyKind::Build)
                    || dep.kinds.contains(&DependencyKind::Runtime)
                {
                    build.insert(dep.name.clone());
                    build.extend(reach.iter().cloned());
                }
                if dep.kinds.contains(&DependencyKind::Test) {
                    test.insert(dep.name.clone());
                    test.extend(reach.iter().cloned());
                }
            }

            entries.push(PlannedFormula {
                formula: Arc::clone(formula),
                requested: requested.contains(name),
                ephemeral: !needed_at_runtime.contains(name),
                dependencies: edges.clone(),
                build_closure: ordered(build),
                runtime_closure: ordered(runtime[name.as_str()].clone()),
                test_closure: ordered(test),
            });
        }

        debug!(
            "Resolved {} into {} formula(s): {}",
            requested.iter().cloned().collect::<Vec<_>>().join(", "),
            entries.len(),
            walk.order.join(" -> ")
        );

        Ok(BuildPlan {
            platform_key: self.platform.key(),
            targets: requested.into_iter().collect(),
            entries,
            graph,
        })
    }

    fn lookup(&self, name: &str, required_by: Option<&str>) -> Result<&'a Arc<Formula>> {
        self.formulas.get(name).ok_or_else(|| Error::UnknownFormula {
            name: name.to_string(),
            required_by: required_by.map(str::to_string),
        })
    }

    fn visit(
        &self,
        name: &str,
        required_by: Option<&str>,
        requested: &BTreeSet<String>,
        options: ResolveOptions,
        walk: &mut Walk,
    ) -> Result<()> {
        if walk.visited.contains(name) {
            return Ok(());
        }
        if walk.visiting.contains(name) {
            let start = walk.stack.iter().position(|n| n == name).unwrap_or(0);
            let mut path = walk.stack[start..].to_vec();
            path.push(name.to_string());
            return Err(Error::DependencyCycle { path });
        }

        let formula = self.lookup(name, required_by)?;
        if !formula.supports(self.platform) {
            return Err(Error::UnsupportedPlatform {
                formula: name.to_string(),
                platform: self.platform.key(),
            });
        }

        walk.visiting.insert(name.to_string());
        walk.stack.push(name.to_string());

        let include_tests = options.with_tests && requested.contains(name);
        let mut edges: Vec<PlannedDependency> = formula
            .dependencies()
            .iter()
            .filter(|dep| {
                let applies = dep.applies_to(self.platform);
                if !applies {
                    debug!(
                        "Pruning {} -> {} (not needed on {})",
                        name,
                        dep.name(),
                        self.platform
                    );
                }
                applies
            })
            .filter_map(|dep| {
                let kinds: BTreeSet<DependencyKind> = dep
                    .kinds()
                    .iter()
                    .copied()
                    .filter(|kind| include_tests || *kind != DependencyKind::Test)
                    .collect();
                (!kinds.is_empty()).then(|| PlannedDependency {
                    name: dep.name().to_string(),
                    kinds,
                })
            })
            .collect();
        edges.sort_by(|a, b| a.name.cmp(&b.name));

        for edge in &edges {
            self.visit(&edge.name, Some(name), requested, options, walk)?;
        }

        walk.stack.pop();
        walk.visiting.remove(name);
        walk.visited.insert(name.to_string());
        walk.order.push(name.to_string());
        walk.edges.insert(name.to_string(), edges);
        Ok(())
    }
}

/// Transitive runtime dependencies of `name`
fn runtime_reach(name: &str, edges: &BTreeMap<String, Vec<PlannedDependency>>) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut queue = vec![name.to_string()];
    while let Some(next) = queue.pop() {
        for dep in edges.get(&next).into_iter().flatten() {
            if dep.kinds.contains(&DependencyKind::Runtime) && found.insert(dep.name.clone()) {
                queue.push(dep.name.clone());
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Os};
    use crate::recipe::parser::parse_formula;

    const SHA: &str = "529c6a58b3b5c5eb3faab07f2bf752155868b912e4f753e432d14040ff4f4262";

    fn formula(name: &str, deps: &[(&str, &str)], extra: &str) -> Formula {
        let mut text = format!(
            "[formula]\nname = \"{name}\"\nversion = \"1.0\"\nlicense = \"MIT\"\n\n\
             [source]\nurl = \"https://example.com/{name}-1.0.tar.gz\"\n\
             checksum = \"{SHA}\"\n{extra}\n"
        );
        for (dep, kinds) in deps {
            text.push_str(&format!(
                "\n[[dependencies]]\nname = \"{dep}\"\nkind = [{kinds}]\n"
            ));
        }
        parse_formula(&text).unwrap()
    }

    fn linux() -> Platform {
        Platform::new(Arch::X86_64, Os::Linux, None)
    }

    fn btrfs_set() -> FormulaSet {
        FormulaSet::from_formulas([
            formula(
                "btrfs-progs",
                &[
                    ("pkgconf", "\"build\""),
                    ("python@3.13", "\"build\", \"test\""),
                    ("e2fsprogs", ""),
                    ("zlib", ""),
                    ("zstd", ""),
                ],
                "[requirements]\nos = [\"linux\"]\n",
            ),
            formula("pkgconf", &[], ""),
            formula("python@3.13", &[("zlib", "")], ""),
            formula("e2fsprogs", &[("util-linux", "")], ""),
            formula("util-linux", &[], ""),
            formula("zlib", &[], ""),
            formula("zstd", &[], ""),
        ])
        .unwrap()
    }

    #[test]
    fn test_wiki_orders_go_first() {
        let set = FormulaSet::from_formulas([
            formula("wiki", &[("go", "\"build\"")], ""),
            formula("go", &[], ""),
        ])
        .unwrap();
        let platform = linux();
        let plan = Resolver::new(&set, &platform)
            .resolve(&["wiki"], ResolveOptions::default())
            .unwrap();
        assert_eq!(plan.order(), vec!["go", "wiki"]);
        assert!(plan.get("go").unwrap().is_ephemeral());
        assert!(!plan.get("wiki").unwrap().is_ephemeral());
        assert_eq!(plan.get("wiki").unwrap().build_closure(), ["go"]);
        assert!(plan.get("wiki").unwrap().runtime_closure().is_empty());
    }

    #[test]
    fn test_dependencies_precede_dependents_alphabetically() {
        let set = btrfs_set();
        let platform = linux();
        let plan = Resolver::new(&set, &platform)
            .resolve(&["btrfs-progs"], ResolveOptions::default())
            .unwrap();
        assert_eq!(
            plan.order(),
            vec![
                "util-linux",
                "e2fsprogs",
                "pkgconf",
                "zlib",
                "python@3.13",
                "zstd",
                "btrfs-progs"
            ]
        );
        let entry = plan.get("btrfs-progs").unwrap();
        assert_eq!(
            entry.runtime_closure(),
            ["util-linux", "e2fsprogs", "zlib", "zstd"]
        );
        assert!(plan.get("pkgconf").unwrap().is_ephemeral());
        assert!(plan.get("python@3.13").unwrap().is_ephemeral());
        assert!(!plan.get("zlib").unwrap().is_ephemeral());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let set = btrfs_set();
        let platform = linux();
        let resolver = Resolver::new(&set, &platform);
        let first = resolver.resolve(&["btrfs-progs"], ResolveOptions::default()).unwrap();
        let second = resolver.resolve(&["btrfs-progs"], ResolveOptions::default()).unwrap();
        assert_eq!(first.order(), second.order());
        assert_eq!(first.graph(), second.graph());
    }

    #[test]
    fn test_test_deps_only_with_tests() {
        let set = FormulaSet::from_formulas([
            formula("app", &[("checker", "\"test\"")], ""),
            formula("checker", &[], ""),
        ])
        .unwrap();
        let platform = linux();
        let resolver = Resolver::new(&set, &platform);

        let plain = resolver.resolve(&["app"], ResolveOptions::default()).unwrap();
        assert_eq!(plain.order(), vec!["app"]);

        let with_tests = resolver
            .resolve(&["app"], ResolveOptions { with_tests: true })
            .unwrap();
        assert_eq!(with_tests.order(), vec!["checker", "app"]);
        assert_eq!(with_tests.get("app").unwrap().test_closure(), ["checker"]);
        assert!(with_tests.get("app").unwrap().build_closure().is_empty());
    }

    #[test]
    fn test_platform_gated_dependency_pruned() {
        let app = format!(
            "[formula]\nname = \"app\"\nversion = \"1\"\nlicense = \"MIT\"\n\n\
             [source]\nurl = \"https://example.com/app.tar.gz\"\nchecksum = \"{SHA}\"\n\n\
             [[dependencies]]\nname = \"systemd\"\nplatform = {{ os = [\"linux\"] }}\n"
        );
        let set = FormulaSet::from_formulas([
            parse_formula(&app).unwrap(),
            formula("systemd", &[], ""),
        ])
        .unwrap();

        let mac = Platform::parse_key("arm64_sonoma").unwrap();
        let plan = Resolver::new(&set, &mac)
            .resolve(&["app"], ResolveOptions::default())
            .unwrap();
        assert_eq!(plan.order(), vec!["app"]);

        let platform = linux();
        let plan = Resolver::new(&set, &platform)
            .resolve(&["app"], ResolveOptions::default())
            .unwrap();
        assert_eq!(plan.order(), vec!["systemd", "app"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let set = FormulaSet::from_formulas([
            formula("a", &[("b", "")], ""),
            formula("b", &[("c", "")], ""),
            formula("c", &[("a", "\"build\"")], ""),
        ])
        .unwrap();
        let platform = linux();
        let err = Resolver::new(&set, &platform)
            .resolve(&["a"], ResolveOptions::default())
            .unwrap_err();
        match err {
            Error::DependencyCycle { path } => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_two_node_cycle_from_either_side() {
        let set = FormulaSet::from_formulas([
            formula("a", &[("b", "")], ""),
            formula("b", &[("a", "")], ""),
        ])
        .unwrap();
        let platform = linux();
        let err = Resolver::new(&set, &platform)
            .resolve(&["b"], ResolveOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { ref path } if path == &["b", "a", "b"]));
    }

    #[test]
    fn test_unknown_dependency_names_parent() {
        let set = FormulaSet::from_formulas([formula("app", &[("ghost", "")], "")]).unwrap();
        let platform = linux();
        let err = Resolver::new(&set, &platform)
            .resolve(&["app"], ResolveOptions::default())
            .unwrap_err();
        match err {
            Error::UnknownFormula { name, required_by } => {
                assert_eq!(name, "ghost");
                assert_eq!(required_by.as_deref(), Some("app"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsupported_platform() {
        let set = btrfs_set();
        let mac = Platform::parse_key("arm64_darwin").unwrap();
        let err = Resolver::new(&set, &mac)
            .resolve(&["btrfs-progs"], ResolveOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform { .. }));
    }

    #[test]
    fn test_json_rendering() {
        let set = btrfs_set();
        let platform = linux();
        let plan = Resolver::new(&set, &platform)
            .resolve(&["zlib"], ResolveOptions::default())
            .unwrap();
        let json = plan.to_json();
        assert_eq!(json["platform"], "x86_64_linux");
        assert_eq!(json["order"][0]["name"], "zlib");
    }
}
