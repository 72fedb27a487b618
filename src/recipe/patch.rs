// src/recipe/patch.rs

//! Embedded patch parsing and atomic application
//!
//! A recipe may embed one unified diff touching several files. The diff is
//! split into per-file sections, each parsed with `diffy`, and applied
//! entirely in memory first. Only when every hunk of every file has found its
//! place is anything written, and a failed write restores the files already
//! touched. A hunk that does not apply leaves the tree byte-identical.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// How far (in lines) a hunk may drift from its stated position
pub const DEFAULT_MAX_OFFSET: usize = 1000;

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Delete(String),
    Insert(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    /// 1-based start line in the original file (0 for pure insertions at the top)
    old_start: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|line| match line {
            HunkLine::Context(text) | HunkLine::Delete(text) => Some(text.as_str()),
            HunkLine::Insert(_) => None,
        })
    }

    fn old_len(&self) -> usize {
        self.old_lines().count()
    }
}

/// What a file section does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Modify,
    Create,
    Delete,
}

/// The hunks for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Path as written in the diff header (before stripping)
    header_path: String,
    change: FileChange,
    hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn header_path(&self) -> &str {
        &self.header_path
    }

    pub fn change(&self) -> FileChange {
        self.change
    }

    pub fn hunk_count(&self) -> usize {
        self.hunks.len()
    }
}

/// A parsed multi-file unified diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    files: Vec<FilePatch>,
    strip: usize,
    directory: Option<String>,
}

impl Patch {
    /// Parse unified diff text
    pub fn parse(diff: &str, strip: usize, directory: Option<String>) -> Result<Self> {
        let sections = split_sections(diff)?;
        if sections.is_empty() {
            return Err(Error::ParseError("patch contains no file sections".to_string()));
        }

        let files = sections
            .iter()
            .map(|section| parse_section(section))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            files,
            strip,
            directory,
        })
    }

    pub fn files(&self) -> &[FilePatch] {
        &self.files
    }

    pub fn strip(&self) -> usize {
        self.strip
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    pub fn hunk_count(&self) -> usize {
        self.files.iter().map(|f| f.hunks.len()).sum()
    }

    /// Target path of a file section relative to the patch root
    fn target_path(&self, file: &FilePatch) -> std::result::Result<PathBuf, String> {
        let path = Path::new(&file.header_path);
        let mut components = path.components().filter(|c| matches!(c, Component::Normal(_)));
        for _ in 0..self.strip {
            if components.next().is_none() {
                return Err(format!("cannot strip {} components", self.strip));
            }
        }
        let relative: PathBuf = components.collect();
        if relative.as_os_str().is_empty() {
            return Err("empty path after stripping".to_string());
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err("path escapes the source tree".to_string());
        }
        Ok(relative)
    }
}

/// Split a diff into per-file sections, normalized for diffy
///
/// Sections start at a `--- ` line immediately followed by a `+++ ` line and
/// end after their last hunk; anything in between (`diff --git`, `index`
/// lines, prose) is dropped.
fn split_sections(diff: &str) -> Result<Vec<String>> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut sections = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let is_header = lines[i].starts_with("--- ")
            && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "));
        if !is_header {
            i += 1;
            continue;
        }

        let mut section = format!("{}\n{}\n", lines[i], lines[i + 1]);
        i += 2;

        while i < lines.len() && lines[i].starts_with("@@ ") {
            let (mut old_left, mut new_left) = hunk_counts(lines[i])?;
            section.push_str(lines[i]);
            section.push('\n');
            i += 1;

            while (old_left > 0 || new_left > 0) && i < lines.len() {
                let line = lines[i];
                match line.chars().next() {
                    // editors strip the single space of blank context lines
                    None => {
                        section.push_str(" \n");
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                    Some(' ') => {
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                        section.push_str(line);
                        section.push('\n');
                    }
                    Some('-') => {
                        old_left = old_left.saturating_sub(1);
                        section.push_str(line);
                        section.push('\n');
                    }
                    Some('+') => {
                        new_left = new_left.saturating_sub(1);
                        section.push_str(line);
                        section.push('\n');
                    }
                    Some('\\') => {
                        section.push_str(line);
                        section.push('\n');
                    }
                    Some(_) => {
                        return Err(Error::ParseError(format!(
                            "unexpected line in hunk: '{line}'"
                        )));
                    }
                }
                i += 1;
            }

            if old_left > 0 || new_left > 0 {
                return Err(Error::ParseError("truncated hunk at end of patch".to_string()));
            }

            if lines.get(i).is_some_and(|l| l.starts_with('\\')) {
                section.push_str(lines[i]);
                section.push('\n');
                i += 1;
            }
        }

        sections.push(section);
    }

    Ok(sections)
}

/// Line counts from `@@ -a,b +c,d @@` (counts default to 1)
fn hunk_counts(header: &str) -> Result<(usize, usize)> {
    let bad = || Error::ParseError(format!("malformed hunk header: '{header}'"));
    let inner = header
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(bad)?;
    let mut parts = inner.split_whitespace();
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(bad)?;
    let new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(bad)?;
    let count = |range: &str| -> Result<usize> {
        match range.split_once(',') {
            Some((_, len)) => len.parse().map_err(|_| bad()),
            None => range.parse::<usize>().map(|_| 1).map_err(|_| bad()),
        }
    };
    Ok((count(old)?, count(new)?))
}

fn header_name(name: &str) -> String {
    name.split('\t').next().unwrap_or(name).trim().to_string()
}

fn parse_section(section: &str) -> Result<FilePatch> {
    let parsed = diffy::Patch::from_str(section)
        .map_err(|e| Error::ParseError(format!("invalid unified diff: {e}")))?;

    let original = parsed.original().map(header_name);
    let modified = parsed.modified().map(header_name);

    let (header_path, change) = match (original.as_deref(), modified.as_deref()) {
        (Some(DEV_NULL), Some(new)) => (new.to_string(), FileChange::Create),
        (Some(old), Some(DEV_NULL)) => (old.to_string(), FileChange::Delete),
        (_, Some(new)) => (new.to_string(), FileChange::Modify),
        (Some(old), None) => (old.to_string(), FileChange::Modify),
        (None, None) => {
            return Err(Error::ParseError("file section without a path".to_string()));
        }
    };

    let hunks = parsed
        .hunks()
        .iter()
        .map(|hunk| Hunk {
            old_start: hunk.old_range().start(),
            lines: hunk
                .lines()
                .iter()
                .map(|line| match line {
                    diffy::Line::Context(text) => HunkLine::Context(text.to_string()),
                    diffy::Line::Delete(text) => HunkLine::Delete(text.to_string()),
                    diffy::Line::Insert(text) => HunkLine::Insert(text.to_string()),
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    if hunks.is_empty() {
        return Err(Error::ParseError(format!("no hunks for {header_path}")));
    }

    Ok(FilePatch {
        header_path,
        change,
        hunks,
    })
}

fn same_line(file_line: &str, hunk_line: &str) -> bool {
    file_line.trim_end_matches(['\n', '\r']) == hunk_line.trim_end_matches(['\n', '\r'])
}

/// Summary of a successful application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub modified: Vec<PathBuf>,
    pub created: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub hunks: usize,
}

/// Applies [`Patch`]es to a source tree
#[derive(Debug, Clone)]
pub struct PatchApplier {
    max_offset: usize,
}

impl Default for PatchApplier {
    fn default() -> Self {
        Self {
            max_offset: DEFAULT_MAX_OFFSET,
        }
    }
}

impl PatchApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_offset(max_offset: usize) -> Self {
        Self { max_offset }
    }

    /// Apply every hunk or nothing
    pub fn apply(&self, patch: &Patch, source_root: &Path) -> Result<PatchReport> {
        let root = match patch.directory() {
            Some(dir) => source_root.join(dir),
            None => source_root.to_path_buf(),
        };

        // target -> new content (None = delete)
        let mut pending: BTreeMap<PathBuf, Option<String>> = BTreeMap::new();
        let mut report = PatchReport::default();
        let mut hunk_index = 0;

        for file in patch.files() {
            let display = file.header_path.clone();
            let first_hunk = hunk_index + 1;
            let relative = patch.target_path(file).map_err(|reason| Error::PatchFailed {
                hunk: first_hunk,
                file: display.clone(),
                reason,
            })?;
            let target = root.join(&relative);

            let current = match pending.get(&target) {
                Some(content) => content.clone(),
                None => read_text(&target).map_err(|reason| Error::PatchFailed {
                    hunk: first_hunk,
                    file: display.clone(),
                    reason,
                })?,
            };

            let updated = match (file.change, current) {
                (FileChange::Create, Some(_)) => {
                    return Err(Error::PatchFailed {
                        hunk: first_hunk,
                        file: display,
                        reason: "file to be created already exists".to_string(),
                    });
                }
                (FileChange::Modify | FileChange::Delete, None) => {
                    return Err(Error::PatchFailed {
                        hunk: first_hunk,
                        file: display,
                        reason: "file not found".to_string(),
                    });
                }
                (FileChange::Create, None) => {
                    let content = self.apply_hunks(&display, "", &file.hunks, &mut hunk_index)?;
                    report.created.push(relative);
                    Some(content)
                }
                (FileChange::Modify, Some(original)) => {
                    let content =
                        self.apply_hunks(&display, &original, &file.hunks, &mut hunk_index)?;
                    report.modified.push(relative);
                    Some(content)
                }
                (FileChange::Delete, Some(original)) => {
                    let remaining =
                        self.apply_hunks(&display, &original, &file.hunks, &mut hunk_index)?;
                    if !remaining.is_empty() {
                        return Err(Error::PatchFailed {
                            hunk: hunk_index,
                            file: display,
                            reason: "file to be deleted has unexpected content".to_string(),
                        });
                    }
                    report.deleted.push(relative);
                    None
                }
            };
            pending.insert(target, updated);
        }

        report.hunks = hunk_index;
        commit(&pending)?;
        info!(
            "Applied {} hunk(s) to {} file(s)",
            report.hunks,
            pending.len()
        );
        Ok(report)
    }

    fn apply_hunks(
        &self,
        file: &str,
        original: &str,
        hunks: &[Hunk],
        hunk_index: &mut usize,
    ) -> Result<String> {
        let lines: Vec<&str> = original.split_inclusive('\n').collect();
        let mut out = String::with_capacity(original.len());
        let mut cursor = 0usize;
        let mut offset: isize = 0;

        for hunk in hunks {
            *hunk_index += 1;
            let old: Vec<&str> = hunk.old_lines().collect();
            let stated = if old.is_empty() {
                hunk.old_start
            } else {
                hunk.old_start.saturating_sub(1)
            };
            let expected = (stated as isize + offset).max(0) as usize;

            let pos = self
                .locate(&lines, &old, expected, cursor)
                .ok_or_else(|| Error::PatchFailed {
                    hunk: *hunk_index,
                    file: file.to_string(),
                    reason: format!("context does not match near line {}", stated + 1),
                })?;

            if pos != expected {
                debug!(
                    "Hunk #{} of {} applied with offset {}",
                    hunk_index,
                    file,
                    pos as isize - expected as isize
                );
            }

            for line in &lines[cursor..pos] {
                out.push_str(line);
            }

            let mut i = pos;
            for line in &hunk.lines {
                match line {
                    HunkLine::Context(_) => {
                        out.push_str(lines[i]);
                        i += 1;
                    }
                    HunkLine::Delete(_) => i += 1,
                    HunkLine::Insert(text) => out.push_str(text),
                }
            }

            cursor = pos + old.len();
            offset = pos as isize - stated as isize;
        }

        for line in &lines[cursor..] {
            out.push_str(line);
        }
        Ok(out)
    }

    /// First position at or after `min` where `old` matches, nearest to `expected`
    fn locate(&self, lines: &[&str], old: &[&str], expected: usize, min: usize) -> Option<usize> {
        let fits = |pos: usize| {
            pos >= min
                && pos + old.len() <= lines.len()
                && old
                    .iter()
                    .enumerate()
                    .all(|(k, want)| same_line(lines[pos + k], want))
        };

        if fits(expected) {
            return Some(expected);
        }
        for delta in 1..=self.max_offset {
            if fits(expected + delta) {
                return Some(expected + delta);
            }
            if delta <= expected && fits(expected - delta) {
                return Some(expected - delta);
            }
        }
        None
    }
}

fn read_text(path: &Path) -> std::result::Result<Option<String>, String> {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| "file is not valid UTF-8".to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.to_string()),
    }
}

/// Write all pending changes, restoring originals if any write fails
fn commit(pending: &BTreeMap<PathBuf, Option<String>>) -> Result<()> {
    let mut backups: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(pending.len());

    for (path, content) in pending {
        let original = match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                restore(&backups);
                return Err(e.into());
            }
        };
        backups.push((path.clone(), original));

        let written = match content {
            Some(text) => path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| fs::write(path, text)),
            None => fs::remove_file(path),
        };

        if let Err(e) = written {
            warn!("Write to {} failed, restoring patched files", path.display());
            restore(&backups);
            return Err(Error::IoError(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            )));
        }
    }

    Ok(())
}

fn restore(backups: &[(PathBuf, Option<Vec<u8>>)]) {
    for (path, original) in backups.iter().rev() {
        let restored = match original {
            Some(bytes) => fs::write(path, bytes),
            None => match fs::remove_file(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = restored {
            warn!("Failed to restore {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = "a\nb\nc\nd\ne\nf\ng\nh\n";

    fn two_hunk_patch() -> &'static str {
        "\
diff --git a/conf.py b/conf.py
index 7d90916..4550842 100644
--- a/conf.py
+++ b/conf.py
@@ -1,3 +1,2 @@
 a
-b
 c
@@ -6,3 +5,4 @@
 f
+f2
 g
 h
"
    }

    #[test]
    fn test_parse_counts_hunks() {
        let patch = Patch::parse(two_hunk_patch(), 1, None).unwrap();
        assert_eq!(patch.files().len(), 1);
        assert_eq!(patch.hunk_count(), 2);
        assert_eq!(patch.files()[0].header_path(), "b/conf.py");
        assert_eq!(patch.files()[0].change(), FileChange::Modify);
    }

    #[test]
    fn test_apply_modifies_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("conf.py"), CONF).unwrap();

        let patch = Patch::parse(two_hunk_patch(), 1, None).unwrap();
        let report = PatchApplier::new().apply(&patch, dir.path()).unwrap();

        assert_eq!(report.hunks, 2);
        assert_eq!(report.modified, vec![PathBuf::from("conf.py")]);
        let patched = fs::read_to_string(dir.path().join("conf.py")).unwrap();
        assert_eq!(patched, "a\nc\nd\ne\nf\nf2\ng\nh\n");
    }

    #[test]
    fn test_apply_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("conf.py"), format!("x\ny\n{CONF}")).unwrap();

        let patch = Patch::parse(two_hunk_patch(), 1, None).unwrap();
        PatchApplier::new().apply(&patch, dir.path()).unwrap();
        let patched = fs::read_to_string(dir.path().join("conf.py")).unwrap();
        assert_eq!(patched, "x\ny\na\nc\nd\ne\nf\nf2\ng\nh\n");
    }

    #[test]
    fn test_failed_hunk_leaves_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let drifted = "a\nb\nc\nd\ne\nF\nG\nH\n";
        fs::write(dir.path().join("conf.py"), drifted).unwrap();

        let patch = Patch::parse(two_hunk_patch(), 1, None).unwrap();
        let err = PatchApplier::new().apply(&patch, dir.path()).unwrap_err();
        match err {
            Error::PatchFailed { hunk, file, .. } => {
                assert_eq!(hunk, 2);
                assert_eq!(file, "b/conf.py");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_to_string(dir.path().join("conf.py")).unwrap(), drifted);
    }

    #[test]
    fn test_multi_file_atomicity() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.txt"), "keep\nold\n").unwrap();
        fs::write(dir.path().join("two.txt"), "unrelated\n").unwrap();

        let diff = "\
--- a/one.txt
+++ b/one.txt
@@ -1,2 +1,2 @@
 keep
-old
+new
--- a/two.txt
+++ b/two.txt
@@ -1 +1 @@
-expected
+changed
";
        let patch = Patch::parse(diff, 1, None).unwrap();
        let err = PatchApplier::new().apply(&patch, dir.path()).unwrap_err();
        assert!(matches!(err, Error::PatchFailed { hunk: 2, .. }));
        assert_eq!(fs::read_to_string(dir.path().join("one.txt")).unwrap(), "keep\nold\n");
    }

    #[test]
    fn test_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gone.txt"), "bye\n").unwrap();

        let diff = "\
--- /dev/null
+++ b/docs/new.txt
@@ -0,0 +1,2 @@
+hello
+world
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";
        let patch = Patch::parse(diff, 1, None).unwrap();
        let report = PatchApplier::new().apply(&patch, dir.path()).unwrap();
        assert_eq!(report.created, vec![PathBuf::from("docs/new.txt")]);
        assert_eq!(report.deleted, vec![PathBuf::from("gone.txt")]);
        assert_eq!(
            fs::read_to_string(dir.path().join("docs/new.txt")).unwrap(),
            "hello\nworld\n"
        );
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[test]
    fn test_blank_context_lines_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), "one\n\ntwo\n").unwrap();

        // the blank context line lost its leading space
        let diff = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n one\n\n-two\n+three\n";
        let patch = Patch::parse(diff, 1, None).unwrap();
        PatchApplier::new().apply(&patch, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "one\n\nthree\n");
    }

    #[test]
    fn test_directory_and_strip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/f"), "x\n").unwrap();

        let diff = "--- f\n+++ f\n@@ -1 +1 @@\n-x\n+y\n";
        let patch = Patch::parse(diff, 0, Some("sub".into())).unwrap();
        PatchApplier::new().apply(&patch, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("sub/f")).unwrap(), "y\n");
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let patch = Patch::parse(two_hunk_patch(), 1, None).unwrap();
        let err = PatchApplier::new().apply(&patch, dir.path()).unwrap_err();
        assert!(matches!(err, Error::PatchFailed { hunk: 1, .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Patch::parse("not a diff", 1, None).is_err());
        assert!(Patch::parse("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n x\n", 1, None).is_err());
    }
}
