//! Core vocabulary types shared by the index and the resolver.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// An OS/architecture pair such as `x86_64-linux`.
pub type System = String;

/// The `install.<INSTALL-ID>` key naming a dependency slot in a manifest.
pub type InstallId = String;

/// Ordered dotted key sequence into a nested namespace of packages.
pub type AttrPath = Vec<String>;

/// An absolute attribute path which may carry a glob (`None`) in place of
/// its system element.
pub type AttrPathGlob = Vec<Option<String>>;

/// The closed set of systems an index may contain and a manifest
/// may request.
pub const SUPPORTED_SYSTEMS: [&str; 4] = [
    "x86_64-linux",
    "aarch64-linux",
    "x86_64-darwin",
    "aarch64-darwin",
];

pub fn is_supported_system(system: &str) -> bool {
    SUPPORTED_SYSTEMS.contains(&system)
}

/// The system tag of the host this process runs on.
pub fn current_system() -> System {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}-{}", std::env::consts::ARCH, os)
}

/// Top level subtrees a package universe is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subtree {
    /// The large, curated package tree.
    LegacyPackages,
    /// Packages exposed by an arbitrary snapshot's own outputs.
    Packages,
}

impl Subtree {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subtree::LegacyPackages => "legacyPackages",
            Subtree::Packages => "packages",
        }
    }
}

impl fmt::Display for Subtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subtree {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacyPackages" => Ok(Subtree::LegacyPackages),
            "packages" => Ok(Subtree::Packages),
            other => Err(Error::msg(
                ErrorKind::InvalidArg,
                format!("unrecognized subtree '{other}'"),
            )),
        }
    }
}
