// src/recipe/cache.rs

//! Artifact cache: the index of installed formulas
//!
//! Every installed formula (built from source or unpacked from a bottle)
//! is recorded in a SQLite index keyed by (name, version, platform key),
//! together with the manifest of files in its prefix. Re-installing an
//! unchanged formula is a lookup. Writers serialize per key through an
//! exclusive file lock so concurrent installs of the same formula collapse
//! into one.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/Cellar/<name>/<version>/      install prefixes
//! <root>/var/db/artifacts.db           index
//! <root>/var/cache/sources/            verified source archives
//! <root>/var/cache/bottles/            verified bottles
//! <root>/var/lock/                     per-key locks
//! <root>/var/tmp/                      build and bottle staging directories
//! ```

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, hash_file, sha256};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Paths under the state root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cellar(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    pub fn prefix(&self, name: &str, version_dir: &str) -> PathBuf {
        self.cellar().join(name).join(version_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("var/db/artifacts.db")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("var/cache/sources")
    }

    pub fn bottles_dir(&self) -> PathBuf {
        self.root.join("var/cache/bottles")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("var/lock")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("var/tmp")
    }

    /// Create every directory of the layout
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.cellar(),
            self.root.join("var/db"),
            self.sources_dir(),
            self.bottles_dir(),
            self.locks_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::InitError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Cache key: one formula version on one platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub name: String,
    pub version: String,
    pub platform_key: String,
}

impl ArtifactKey {
    pub fn new(name: &str, version: &str, platform_key: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            platform_key: platform_key.to_string(),
        }
    }

    fn lock_file_name(&self) -> String {
        format!("{}--{}.{}.lock", self.name, self.version, self.platform_key).replace('/', "_")
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.platform_key)
    }
}

/// How an artifact was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    Built,
    Bottle,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactSource::Built => "built",
            ArtifactSource::Bottle => "bottle",
        }
    }
}

impl FromStr for ArtifactSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "built" => Ok(ArtifactSource::Built),
            "bottle" => Ok(ArtifactSource::Bottle),
            other => Err(Error::ParseError(format!("unknown artifact source '{other}'"))),
        }
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file of an installed prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative to the prefix
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub mode: u32,
}

/// An installed formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub name: String,
    pub version: String,
    pub revision: u32,
    pub platform_key: String,
    pub prefix: PathBuf,
    pub source: ArtifactSource,
    /// Checksum of the bottle or source archive the prefix came from
    pub checksum: String,
    pub runtime_dependencies: Vec<String>,
    pub files: Vec<ManifestEntry>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledArtifact {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(&self.name, &self.version, &self.platform_key)
    }
}

/// Walk a prefix and record every file and symlink
pub fn manifest_for(prefix: &Path) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(prefix).sort_by_file_name().min_depth(1) {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(prefix)
            .map_err(|e| Error::IoError(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let metadata = fs::symlink_metadata(entry.path())?;

        let (sha, size) = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            (sha256(target.to_string_lossy().as_bytes()), 0)
        } else {
            let checksum = hash_file(HashAlgorithm::Sha256, entry.path())?;
            (checksum.hex().to_string(), metadata.len())
        };

        entries.push(ManifestEntry {
            path: relative,
            sha256: sha,
            size,
            mode: metadata.permissions().mode(),
        });
    }
    Ok(entries)
}

/// Exclusive per-key lock; released on drop
pub struct ArtifactLock {
    file: File,
    path: PathBuf,
}

impl ArtifactLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// SQLite-backed index of installed artifacts
pub struct ArtifactCache {
    layout: Layout,
    conn: Mutex<Connection>,
}

impl ArtifactCache {
    /// Open (creating if needed) the cache under `layout`
    pub fn open(layout: Layout) -> Result<Self> {
        layout.ensure()?;
        let conn = Connection::open(layout.db_path())?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        migrate(&conn)?;
        Ok(Self {
            layout,
            conn: Mutex::new(conn),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::IoError("artifact cache connection poisoned".to_string()))?;
        f(&mut conn)
    }

    /// The entry stored under `key`, if any
    pub fn lookup(&self, key: &ArtifactKey) -> Result<Option<InstalledArtifact>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, version, revision, platform_key, prefix, source, checksum,
                            runtime_deps, installed_at
                     FROM artifacts WHERE name = ?1 AND version = ?2 AND platform_key = ?3",
                    params![key.name, key.version, key.platform_key],
                    read_row,
                )
                .optional()?;
            match row {
                Some(row) => Ok(Some(load_artifact(conn, row)?)),
                None => Ok(None),
            }
        })
    }

    /// A usable entry: same revision and intact on disk
    ///
    /// Entries of another revision or with missing files are treated as
    /// absent; broken entries are evicted.
    pub fn lookup_current(
        &self,
        key: &ArtifactKey,
        revision: u32,
    ) -> Result<Option<InstalledArtifact>> {
        let Some(artifact) = self.lookup(key)? else {
            return Ok(None);
        };
        if artifact.revision != revision {
            debug!(
                "{} is installed at revision {}, formula is at {}",
                key, artifact.revision, revision
            );
            return Ok(None);
        }
        if !self.verify(&artifact)? {
            return Ok(None);
        }
        Ok(Some(artifact))
    }

    /// Record an installed artifact, replacing any entry with the same key
    pub fn register(&self, artifact: &InstalledArtifact) -> Result<()> {
        let key = artifact.key();
        let replaced = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT prefix FROM artifacts
                     WHERE name = ?1 AND version = ?2 AND platform_key = ?3",
                    params![key.name, key.version, key.platform_key],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "DELETE FROM artifacts WHERE name = ?1 AND version = ?2 AND platform_key = ?3",
                params![key.name, key.version, key.platform_key],
            )?;
            tx.execute(
                "INSERT INTO artifacts
                    (name, version, revision, platform_key, prefix, source, checksum,
                     runtime_deps, installed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    artifact.name,
                    artifact.version,
                    artifact.revision,
                    artifact.platform_key,
                    artifact.prefix.to_string_lossy(),
                    artifact.source.as_str(),
                    artifact.checksum,
                    serde_json::to_string(&artifact.runtime_dependencies)?,
                    artifact.installed_at.to_rfc3339(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO artifact_files (artifact_id, path, sha256, size, mode)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for file in &artifact.files {
                    stmt.execute(params![id, file.path, file.sha256, file.size as i64, file.mode])?;
                }
            }
            tx.commit()?;
            Ok(previous)
        })?;

        if let Some(old_prefix) = replaced.map(PathBuf::from) {
            if old_prefix != artifact.prefix && old_prefix.exists() {
                debug!("Removing superseded prefix {}", old_prefix.display());
                fs::remove_dir_all(&old_prefix)?;
            }
        }

        info!(
            "Registered {} ({}, {} files)",
            key,
            artifact.source,
            artifact.files.len()
        );
        Ok(())
    }

    /// Every entry, ordered by name then version
    pub fn list(&self) -> Result<Vec<InstalledArtifact>> {
        self.with_conn(|conn| {
            let rows = {
                let mut stmt = conn.prepare(
                    "SELECT id, name, version, revision, platform_key, prefix, source, checksum,
                            runtime_deps, installed_at
                     FROM artifacts ORDER BY name, version, platform_key",
                )?;
                stmt.query_map([], read_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            rows.into_iter()
                .map(|row| load_artifact(conn, row))
                .collect()
        })
    }

    /// Installed entries of a formula on a platform, newest first
    pub fn find_by_name(&self, name: &str, platform_key: &str) -> Result<Vec<InstalledArtifact>> {
        let mut found: Vec<InstalledArtifact> = self
            .list()?
            .into_iter()
            .filter(|a| a.name == name && a.platform_key == platform_key)
            .collect();
        found.sort_by(|a, b| b.installed_at.cmp(&a.installed_at));
        Ok(found)
    }

    /// Remove an entry and its prefix
    pub fn remove(&self, key: &ArtifactKey) -> Result<bool> {
        let Some(artifact) = self.lookup(key)? else {
            return Ok(false);
        };
        self.evict(key)?;
        if artifact.prefix.exists() {
            fs::remove_dir_all(&artifact.prefix)?;
        }
        info!("Removed {}", key);
        Ok(true)
    }

    /// Drop the index row only
    fn evict(&self, key: &ArtifactKey) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM artifacts WHERE name = ?1 AND version = ?2 AND platform_key = ?3",
                params![key.name, key.version, key.platform_key],
            )?;
            Ok(())
        })
    }

    /// Remove every entry, prefix and cached download
    pub fn clear(&self) -> Result<usize> {
        let artifacts = self.list()?;
        for artifact in &artifacts {
            self.remove(&artifact.key())?;
        }
        for dir in [self.layout.sources_dir(), self.layout.bottles_dir()] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)?;
        }
        info!("Cleared {} artifact(s)", artifacts.len());
        Ok(artifacts.len())
    }

    /// Check an entry against the disk, evicting it when broken
    pub fn verify(&self, artifact: &InstalledArtifact) -> Result<bool> {
        let reason = if !artifact.prefix.is_dir() {
            Some("prefix is missing".to_string())
        } else {
            artifact
                .files
                .iter()
                .find(|file| {
                    let path = artifact.prefix.join(&file.path);
                    match fs::symlink_metadata(&path) {
                        Ok(meta) => meta.file_type().is_file() && meta.len() != file.size,
                        Err(_) => true,
                    }
                })
                .map(|file| format!("{} is missing or changed", file.path))
        };

        match reason {
            None => Ok(true),
            Some(reason) => {
                warn!("Evicting stale entry {}: {}", artifact.key(), reason);
                self.evict(&artifact.key())?;
                Ok(false)
            }
        }
    }

    /// Take the exclusive lock for `key`, blocking until it is free
    pub fn lock(&self, key: &ArtifactKey) -> Result<ArtifactLock> {
        let path = self.layout.locks_dir().join(key.lock_file_name());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        file.lock_exclusive().map_err(|e| {
            Error::IoError(format!("Failed to lock {}: {}", path.display(), e))
        })?;
        debug!("Acquired lock {}", path.display());
        Ok(ArtifactLock { file, path })
    }
}

struct ArtifactRow {
    id: i64,
    name: String,
    version: String,
    revision: u32,
    platform_key: String,
    prefix: String,
    source: String,
    checksum: String,
    runtime_deps: String,
    installed_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        revision: row.get(3)?,
        platform_key: row.get(4)?,
        prefix: row.get(5)?,
        source: row.get(6)?,
        checksum: row.get(7)?,
        runtime_deps: row.get(8)?,
        installed_at: row.get(9)?,
    })
}

fn load_artifact(conn: &Connection, row: ArtifactRow) -> Result<InstalledArtifact> {
    let files = {
        let mut stmt = conn.prepare(
            "SELECT path, sha256, size, mode FROM artifact_files
             WHERE artifact_id = ?1 ORDER BY path",
        )?;
        stmt.query_map([row.id], |r| {
            Ok(ManifestEntry {
                path: r.get(0)?,
                sha256: r.get(1)?,
                size: r.get::<_, i64>(2)? as u64,
                mode: r.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let installed_at = DateTime::parse_from_rfc3339(&row.installed_at)
        .map_err(|e| Error::ParseError(format!("invalid timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(InstalledArtifact {
        name: row.name,
        version: row.version,
        revision: row.revision,
        platform_key: row.platform_key,
        prefix: PathBuf::from(row.prefix),
        source: row.source.parse()?,
        checksum: row.checksum,
        runtime_dependencies: serde_json::from_str(&row.runtime_deps)?,
        files,
        installed_at,
    })
}

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Current schema version of the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(version)
}

/// Apply pending migrations
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        debug!("Artifact index schema is up to date (v{})", current);
        return Ok(());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        info!("Applying artifact index migration v{}", version);
        apply_migration(conn, version)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        other => Err(Error::InitError(format!("unknown schema version {other}"))),
    }
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0,
            platform_key TEXT NOT NULL,
            prefix TEXT NOT NULL,
            source TEXT NOT NULL CHECK(source IN ('built', 'bottle')),
            checksum TEXT NOT NULL,
            runtime_deps TEXT NOT NULL DEFAULT '[]',
            installed_at TEXT NOT NULL,
            UNIQUE(name, version, platform_key)
        );

        CREATE INDEX idx_artifacts_name ON artifacts(name);

        CREATE TABLE artifact_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            size INTEGER NOT NULL,
            mode INTEGER NOT NULL,
            UNIQUE(artifact_id, path),
            FOREIGN KEY (artifact_id) REFERENCES artifacts(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_artifact_files_artifact ON artifact_files(artifact_id);
        ",
    )?;
    Ok(())
}
