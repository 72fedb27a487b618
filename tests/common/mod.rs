// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use formulary::hash::sha256;
use formulary::recipe::kitchen::{CancellationToken, CommandOutput, CommandRunner, CommandSpec};
use formulary::recipe::{ArtifactCache, Formula, FormulaSet, Layout, parse_formula};
use formulary::{
    BuildPlan, Error, Fetcher, Kitchen, KitchenConfig, Platform, ResolveOptions, Resolver,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// In-memory fetcher: URL to bytes, recording every request
#[derive(Default)]
pub struct FakeFetcher {
    content: Mutex<BTreeMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.content.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> formulary::Result<Vec<u8>> {
        self.requests.lock().unwrap().push(url.to_string());
        self.content
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::FetchError {
                url: url.to_string(),
                reason: "404 Not Found".to_string(),
                retryable: false,
            })
    }
}

type Handler = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

/// Command runner that records every command and answers from a script
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Handler,
}

impl FakeRunner {
    /// Every command succeeds with no output
    pub fn succeeding() -> Self {
        Self::with(|_| ok(""))
    }

    pub fn with(handler: impl Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines, in call order
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> formulary::Result<CommandOutput> {
        cancel.check()?;
        self.calls.lock().unwrap().push(spec.clone());
        Ok((self.handler)(spec))
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        ..Default::default()
    }
}

pub fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stderr: stderr.to_string(),
        ..Default::default()
    }
}

/// Write `contents` to `path`, creating parents
pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Value following `flag` in an argument list
pub fn arg_after<'a>(spec: &'a CommandSpec, flag: &str) -> Option<&'a str> {
    spec.args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| spec.args.get(i + 1))
        .map(String::as_str)
}

/// `--prefix=<dir>` from an argument list
pub fn prefix_arg(spec: &CommandSpec) -> Option<PathBuf> {
    spec.args
        .iter()
        .find_map(|a| a.strip_prefix("--prefix="))
        .map(PathBuf::from)
}

/// A gzipped tarball with every file under `root/`
pub fn tarball(root: &str, files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{root}/{path}"), contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_ref(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256(bytes))
}

/// Minimal recipe text for `name`, with extra TOML appended
pub fn recipe(name: &str, version: &str, source: &[u8], extra: &str) -> String {
    format!(
        r#"
[formula]
name = "{name}"
version = "{version}"
license = "MIT"

[source]
url = "https://src.example.test/{name}-{version}.tar.gz"
checksum = "{checksum}"
{extra}
"#,
        checksum = sha256_ref(source),
    )
}

pub fn source_url(name: &str, version: &str) -> String {
    format!("https://src.example.test/{name}-{version}.tar.gz")
}

/// A formula with no build steps, served from a generated tarball
pub struct Source {
    pub name: &'static str,
    pub version: &'static str,
    pub bytes: Vec<u8>,
}

impl Source {
    pub fn new(name: &'static str, version: &'static str, files: &[(&str, &str)]) -> Self {
        let root = format!("{name}-{version}");
        Self {
            name,
            version,
            bytes: tarball(&root, files),
        }
    }

    pub fn recipe(&self, extra: &str) -> String {
        recipe(self.name, self.version, &self.bytes, extra)
    }
}

/// State root, formulas, fakes and a kitchen built from them
pub struct Fixture {
    pub dir: TempDir,
    pub fetcher: Arc<FakeFetcher>,
    pub runner: Arc<FakeRunner>,
    pub formulas: FormulaSet,
    pub platform: Platform,
    pub config: KitchenConfig,
}

impl Fixture {
    pub fn new(runner: FakeRunner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KitchenConfig::with_root(dir.path().join("root"));
        config.jobs = 2;
        config.fetch_attempts = 1;
        config.fetch_retry_delay_ms = 0;
        Self {
            dir,
            fetcher: Arc::new(FakeFetcher::default()),
            runner: Arc::new(runner),
            formulas: FormulaSet::new(),
            platform: Platform::parse_key("x86_64_linux").unwrap(),
            config,
        }
    }

    pub fn platform(mut self, key: &str) -> Self {
        self.platform = Platform::parse_key(key).unwrap();
        self
    }

    /// Register a source tarball and the formula built from it
    pub fn add(&mut self, source: &Source, extra: &str) -> Arc<Formula> {
        self.fetcher
            .serve(&source_url(source.name, source.version), source.bytes.clone());
        self.add_recipe(&source.recipe(extra))
    }

    pub fn add_recipe(&mut self, text: &str) -> Arc<Formula> {
        let formula = parse_formula(text).unwrap();
        let name = formula.name().to_string();
        self.formulas.insert(formula).unwrap();
        Arc::clone(self.formulas.get(&name).unwrap())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.config.root)
    }

    pub fn kitchen(&self) -> Kitchen {
        let cache = ArtifactCache::open(self.layout()).unwrap();
        Kitchen::new(
            self.config.clone(),
            Arc::new(cache),
            self.fetcher.clone(),
            self.runner.clone(),
            self.platform.clone(),
        )
    }

    pub fn plan(&self, targets: &[&str]) -> BuildPlan {
        Resolver::new(&self.formulas, &self.platform)
            .resolve(targets, ResolveOptions { with_tests: self.config.run_tests })
            .unwrap()
    }
}
