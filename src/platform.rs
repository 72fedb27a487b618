// src/platform.rs

//! Target platform detection and bottle platform keys
//!
//! A platform key combines architecture and OS release the way bottle
//! manifests spell them:
//!
//! - Linux: `x86_64_linux`, `arm64_linux`
//! - macOS on Apple silicon: `arm64_sequoia`, `arm64_sonoma`, ...
//! - macOS on Intel: the bare release name (`sonoma`, `ventura`, ...)
//! - macOS with an unknown release: `arm64_darwin` / `x86_64_darwin`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::str::FromStr;
use tracing::debug;

use crate::error::{Error, Result};

/// macOS release codenames with their major version
const MACOS_RELEASES: &[(&str, &str)] = &[
    ("tahoe", "26"),
    ("sequoia", "15"),
    ("sonoma", "14"),
    ("ventura", "13"),
    ("monterey", "12"),
    ("big_sur", "11"),
    ("catalina", "10.15"),
    ("mojave", "10.14"),
    ("high_sierra", "10.13"),
];

/// CPU architecture
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Arm64,
    Other(String),
}

impl Arch {
    pub fn current() -> Self {
        Self::from_name(std::env::consts::ARCH)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "x86_64" | "amd64" => Arch::X86_64,
            "arm64" | "aarch64" => Arch::Arm64,
            other => Arch::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::Other(name) => name,
        }
    }
}

/// Operating system family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Macos,
    Other(String),
}

impl Os {
    pub fn current() -> Self {
        Self::from_name(std::env::consts::OS)
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "linux" => Os::Linux,
            "macos" | "darwin" | "osx" => Os::Macos,
            other => Os::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Os::Linux => "linux",
            Os::Macos => "macos",
            Os::Other(name) => name,
        }
    }
}

/// The platform formulas are resolved and built for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    arch: Arch,
    os: Os,
    /// macOS release codename (`sonoma`), `None` elsewhere
    release: Option<String>,
}

impl Platform {
    pub fn new(arch: Arch, os: Os, release: Option<String>) -> Self {
        Self { arch, os, release }
    }

    /// Detect the host platform
    pub fn detect() -> Self {
        let os = Os::current();
        let release = match os {
            Os::Macos => detect_macos_release(),
            _ => None,
        };
        let platform = Self::new(Arch::current(), os, release);
        debug!("Detected platform {}", platform.key());
        platform
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    pub fn os(&self) -> &Os {
        &self.os
    }

    pub fn release(&self) -> Option<&str> {
        self.release.as_deref()
    }

    /// The bottle manifest key for this platform
    pub fn key(&self) -> String {
        match (&self.os, self.release.as_deref()) {
            (Os::Macos, Some(release)) => match self.arch {
                Arch::X86_64 => release.to_string(),
                _ => format!("{}_{}", self.arch.as_str(), release),
            },
            (Os::Macos, None) => format!("{}_darwin", self.arch.as_str()),
            (os, _) => format!("{}_{}", self.arch.as_str(), os.as_str()),
        }
    }

    /// Parse a platform key such as `x86_64_linux`, `arm64_sonoma` or `ventura`
    pub fn parse_key(key: &str) -> Result<Self> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::ParseError("empty platform key".to_string()));
        }

        let (arch, rest) = if let Some(rest) = key.strip_prefix("x86_64_") {
            (Arch::X86_64, rest)
        } else if let Some(rest) = key.strip_prefix("arm64_") {
            (Arch::Arm64, rest)
        } else if is_macos_release(key) {
            return Ok(Self::new(Arch::X86_64, Os::Macos, Some(key.to_string())));
        } else {
            match key.split_once('_') {
                Some((arch, rest)) if !rest.is_empty() => (Arch::from_name(arch), rest),
                _ => {
                    return Err(Error::ParseError(format!(
                        "invalid platform key '{key}': expected <arch>_<os> or a macOS release"
                    )));
                }
            }
        };

        let platform = if is_macos_release(rest) {
            Self::new(arch, Os::Macos, Some(rest.to_string()))
        } else {
            Self::new(arch, Os::from_name(rest), None)
        };
        Ok(platform)
    }

    /// Whether this platform satisfies a dependency or formula gate
    pub fn satisfies(&self, gate: &PlatformGate) -> bool {
        let os_ok = gate.os.is_empty() || gate.os.iter().any(|os| Os::from_name(os) == self.os);
        let arch_ok =
            gate.arch.is_empty() || gate.arch.iter().any(|a| Arch::from_name(a) == self.arch);
        os_ok && arch_ok
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_key(s)
    }
}

/// Platform predicate attached to a dependency or a formula
///
/// Empty lists match everything; within a list any entry may match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformGate {
    #[serde(default)]
    pub os: Vec<String>,
    #[serde(default)]
    pub arch: Vec<String>,
}

impl PlatformGate {
    pub fn is_unrestricted(&self) -> bool {
        self.os.is_empty() && self.arch.is_empty()
    }

    /// Entries naming an OS or architecture this crate does not know
    pub fn unknown_entries(&self) -> Vec<String> {
        let mut unknown: Vec<String> = self
            .os
            .iter()
            .filter(|os| matches!(Os::from_name(os), Os::Other(_)))
            .cloned()
            .collect();
        unknown.extend(
            self.arch
                .iter()
                .filter(|a| matches!(Arch::from_name(a), Arch::Other(_)))
                .cloned(),
        );
        unknown
    }
}

fn is_macos_release(name: &str) -> bool {
    MACOS_RELEASES.iter().any(|(codename, _)| *codename == name)
}

/// Map `sw_vers -productVersion` onto a release codename
fn detect_macos_release() -> Option<String> {
    let output = Command::new("sw_vers").arg("-productVersion").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    macos_release_for_version(&version)
}

fn macos_release_for_version(version: &str) -> Option<String> {
    MACOS_RELEASES
        .iter()
        .find(|(_, major)| {
            version == *major
                || version
                    .strip_prefix(major)
                    .is_some_and(|rest| rest.starts_with('.'))
        })
        .map(|(codename, _)| codename.to_string())
}
