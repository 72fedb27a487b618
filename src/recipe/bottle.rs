// src/recipe/bottle.rs

//! Bottle manifests, selection and archive handling
//!
//! A bottle is a prebuilt `tar.gz` of an install prefix for one platform.
//! Archive names follow `{name}--{version}.{platform_key}.bottle.tar.gz`
//! (`{version}_{revision}` once the recipe has been revised) and live under
//! the manifest's `root_url`, or `<source origin>/bottles` when none is
//! declared. Entries inside the archive are rooted at `{name}/{version}/`.

use crate::error::{Error, Result};
use crate::hash::Checksum;
use crate::platform::Platform;
use crate::recipe::format::BottleSection;
use crate::recipe::formula::Formula;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use url::Url;
use walkdir::WalkDir;

/// Platform key to checksum, plus where the archives live
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BottleManifest {
    root_url: Option<String>,
    entries: BTreeMap<String, Checksum>,
}

impl BottleManifest {
    /// Validate a `[bottle]` section; the error names the offending key
    pub fn from_section(section: &BottleSection) -> std::result::Result<Self, (String, String)> {
        let mut entries = BTreeMap::new();
        for (key, value) in &section.checksums {
            Platform::parse_key(key)
                .map_err(|e| (format!("bottle.checksums.{key}"), e.to_string()))?;
            let checksum = Checksum::parse(value)
                .map_err(|e| (format!("bottle.checksums.{key}"), e.to_string()))?;
            entries.insert(key.clone(), checksum);
        }
        if let Some(root) = &section.root_url {
            Url::parse(root).map_err(|e| ("bottle.root_url".to_string(), e.to_string()))?;
        }
        Ok(Self {
            root_url: section.root_url.clone(),
            entries,
        })
    }

    pub fn root_url(&self) -> Option<&str> {
        self.root_url.as_deref()
    }

    pub fn get(&self, platform_key: &str) -> Option<&Checksum> {
        self.entries.get(platform_key)
    }

    pub fn platform_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A bottle chosen for installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottleChoice {
    pub url: String,
    pub filename: String,
    pub platform_key: String,
    pub checksum: Checksum,
}

/// `{version}` or `{version}_{revision}`
pub fn version_dir(version: &str, revision: u32) -> String {
    if revision > 0 {
        format!("{version}_{revision}")
    } else {
        version.to_string()
    }
}

/// Archive file name for a formula on a platform
pub fn bottle_filename(name: &str, version: &str, revision: u32, platform_key: &str) -> String {
    format!(
        "{}--{}.{}.bottle.tar.gz",
        name,
        version_dir(version, revision),
        platform_key
    )
}

/// Base URL bottles are expected under
///
/// Remote sources map to `<scheme>://<host>/bottles`; local sources to a
/// `bottles` directory next to the archive.
pub fn default_root_url(source_url: &str) -> String {
    match Url::parse(source_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            format!("{}/bottles", url.origin().ascii_serialization())
        }
        Ok(url) if url.scheme() == "file" => url
            .join("bottles")
            .map(|u| u.to_string())
            .unwrap_or_else(|_| source_url.to_string()),
        _ => Path::new(source_url)
            .parent()
            .unwrap_or(Path::new("."))
            .join("bottles")
            .display()
            .to_string(),
    }
}

/// Decides whether a formula installs from a bottle on this platform
#[derive(Debug, Clone)]
pub struct BottleSelector {
    platform: Platform,
    enabled: bool,
}

impl BottleSelector {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            enabled: true,
        }
    }

    /// A selector that always falls through to source builds
    pub fn disabled(platform: Platform) -> Self {
        Self {
            platform,
            enabled: false,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn select(&self, formula: &Formula) -> Option<BottleChoice> {
        if !self.enabled {
            return None;
        }
        let key = self.platform.key();
        let Some(checksum) = formula.bottle().get(&key) else {
            debug!(
                "No bottle for {} on {}, building from source",
                formula.name(),
                key
            );
            return None;
        };

        let filename = bottle_filename(formula.name(), formula.version(), formula.revision(), &key);
        let root = formula
            .bottle()
            .root_url()
            .map(str::to_string)
            .unwrap_or_else(|| default_root_url(formula.source_url()));
        let url = format!("{}/{}", root.trim_end_matches('/'), filename);

        Some(BottleChoice {
            url,
            filename,
            platform_key: key,
            checksum: checksum.clone(),
        })
    }
}

/// Unpack a verified bottle into `dest`, stripping `{name}/{version}/`
pub fn unpack_bottle(bytes: &[u8], name: &str, version_dir: &str, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let leading = Path::new(name).join(version_dir);
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let relative = path.strip_prefix(&leading).unwrap_or(&path).to_path_buf();

        if relative.as_os_str().is_empty() {
            continue;
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::IoError(format!(
                "bottle entry escapes the prefix: {}",
                path.display()
            )));
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        count += 1;
    }

    info!("Unpacked {} entries into {}", count, dest.display());
    Ok(count)
}

/// Pack an install prefix into a bottle archive
pub fn pack_bottle(prefix: &Path, name: &str, version_dir: &str) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    let leading = PathBuf::from(name).join(version_dir);

    for entry in WalkDir::new(prefix).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(prefix)
            .map_err(|e| Error::IoError(e.to_string()))?;
        builder.append_path_with_name(entry.path(), leading.join(relative))?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}
