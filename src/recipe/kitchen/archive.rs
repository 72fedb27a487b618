// src/recipe/kitchen/archive.rs

//! Source archive extraction for the Kitchen
//!
//! Archives are unpacked in process. The format comes from the file name
//! and, when the name says nothing useful (GitHub tag tarballs, mirrors
//! with query strings), from the leading magic bytes.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supported source archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    TarZst,
    Tar,
}

impl ArchiveFormat {
    /// Format implied by a file name
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if filename.ends_with(".tar.xz") || filename.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if filename.ends_with(".tar.zst") || filename.ends_with(".tzst") {
            Some(ArchiveFormat::TarZst)
        } else if filename.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// Format implied by the first bytes of the file
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        if header.starts_with(&[0x1f, 0x8b]) {
            Some(ArchiveFormat::TarGz)
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Some(ArchiveFormat::TarXz)
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Some(ArchiveFormat::TarZst)
        } else if header.len() >= 262 && &header[257..262] == b"ustar" {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// Detect the format of an archive on disk
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(format) = Self::from_filename(name) {
            return Ok(format);
        }

        let mut header = Vec::with_capacity(512);
        File::open(path)?.take(512).read_to_end(&mut header)?;
        Self::from_magic(&header).ok_or_else(|| {
            Error::ParseError(format!("Unknown archive format: {}", path.display()))
        })
    }
}

/// Extract an archive into `dest`, returning the number of entries
///
/// Supports: .tar.gz, .tgz, .tar.xz, .txz, .tar.zst, .tar
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let format = ArchiveFormat::detect(archive)?;
    fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive)?);

    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
        ArchiveFormat::TarZst => Box::new(zstd::stream::read::Decoder::new(file)?),
        ArchiveFormat::Tar => Box::new(file),
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    let mut count = 0;
    for entry in tar.entries()? {
        let mut entry = entry?;
        // unpack_in refuses entries that would land outside dest
        if entry.unpack_in(dest)? {
            count += 1;
        } else {
            return Err(Error::IoError(format!(
                "archive entry escapes the source directory: {}",
                entry.path()?.display()
            )));
        }
    }

    debug!(
        "Extracted {} entries from {} ({:?})",
        count,
        archive.display(),
        format
    );
    Ok(count)
}

/// The directory builds run in: a lone top-level directory, or `dir` itself
pub fn source_root(dir: &Path) -> Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();

    if entries.len() == 1 && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
        Ok(entries[0].path())
    } else {
        Ok(dir.to_path_buf())
    }
}
