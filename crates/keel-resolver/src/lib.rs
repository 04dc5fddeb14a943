//! The resolution and locking core.
//!
//! Given a manifest declaring abstract package requirements, an optional
//! prior lockfile, and an optional upgrade directive, this crate produces
//! a deterministic lockfile pinning one concrete package (or explicitly
//! none) per install id per target system, drawing candidates from
//! fingerprint-keyed package indexes.

mod compat;
pub mod descriptor;
pub mod environment;
pub mod lockfile;
pub mod manifest;
pub mod manifest_raw;
pub mod registry;

pub use descriptor::{ManifestDescriptor, ManifestDescriptorRaw};
pub use environment::{Environment, Upgrades};
pub use lockfile::{LockedInput, LockedPackage, Lockfile, LockfileRaw, PackageInfo};
pub use manifest::{GlobalManifest, InstallDescriptors, Manifest};
pub use manifest_raw::{GlobalManifestRaw, ManifestRaw, Options};
pub use registry::{RegistryInput, RegistryRaw, SourceRef};
