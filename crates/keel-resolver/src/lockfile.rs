//! The locked form of an environment: a manifest snapshot, registry
//! pins, and one resolved package (or explicitly none) per install id
//! per system.

use std::collections::BTreeMap;
use std::path::Path;

use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::{AttrPath, InstallId, System};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::compat;
use crate::manifest::Manifest;
use crate::manifest_raw::ManifestRaw;
use crate::registry::RegistryRaw;

/// The schema version this crate emits.
pub const LOCKFILE_VERSION: u64 = 0;

/// A fully pinned source reference.
///
/// Two locked inputs are equal iff their URL and attrs are equal.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LockedInput {
    /// Hex fingerprint identifying the snapshot and its index.
    pub fingerprint: String,
    /// Locked URI string.
    pub url: String,
    /// Exploded form of the URI as an attribute set.
    pub attrs: Value,
}

impl LockedInput {
    /// Equality as used by the resolver: the fingerprint is derived from
    /// the rest, so URL + attrs decide.
    pub fn same_input(&self, other: &LockedInput) -> bool {
        self.url == other.url && self.attrs == other.attrs
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::msg(
                ErrorKind::InvalidLockfile,
                "locked input must be an object",
            ));
        };
        let mut input = LockedInput::default();
        for (key, value) in object {
            match key.as_str() {
                "fingerprint" => {
                    let fingerprint = value.as_str().ok_or_else(|| {
                        Error::msg(ErrorKind::InvalidLockfile, "'fingerprint' must be a string")
                    })?;
                    if fingerprint.len() != 64
                        || !fingerprint.chars().all(|chr| chr.is_ascii_hexdigit())
                    {
                        return Err(Error::msg(
                            ErrorKind::InvalidHash,
                            format!("failed to parse locked input fingerprint '{fingerprint}'"),
                        ));
                    }
                    input.fingerprint = fingerprint.to_string();
                }
                "url" => {
                    input.url = value
                        .as_str()
                        .ok_or_else(|| {
                            Error::msg(ErrorKind::InvalidLockfile, "'url' must be a string")
                        })?
                        .to_string();
                }
                "attrs" => input.attrs = value.clone(),
                other => {
                    return Err(Error::msg(
                        ErrorKind::InvalidLockfile,
                        format!("encountered unexpected field '{other}' while parsing locked input"),
                    ));
                }
            }
        }
        Ok(input)
    }
}

/// Details recorded about a locked package for display and for the
/// environment builder.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageInfo {
    pub pname: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
}

/// A package pinned to an exact position in an exact snapshot.
///
/// Two locked packages are equal iff all four parts are equal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LockedPackage {
    pub input: LockedInput,
    #[serde(rename = "attr-path")]
    pub attr_path: AttrPath,
    pub priority: u32,
    pub info: PackageInfo,
}

impl LockedPackage {
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::msg(
                ErrorKind::InvalidLockfile,
                "locked package must be an object",
            ));
        };
        let mut input = None;
        let mut attr_path: Option<AttrPath> = None;
        let mut priority = None;
        let mut info: Option<PackageInfo> = None;
        for (key, value) in object {
            match key.as_str() {
                "input" => input = Some(LockedInput::from_value(value)?),
                "attr-path" => {
                    attr_path = Some(serde_json::from_value(value.clone()).map_err(|err| {
                        Error::caught(
                            ErrorKind::InvalidLockfile,
                            "couldn't parse package field 'attr-path'",
                            err,
                        )
                    })?);
                }
                "priority" => {
                    priority = Some(value.as_u64().ok_or_else(|| {
                        Error::msg(ErrorKind::InvalidLockfile, "'priority' must be an integer")
                    })? as u32);
                }
                "info" => {
                    info = Some(serde_json::from_value(value.clone()).map_err(|err| {
                        Error::caught(
                            ErrorKind::InvalidLockfile,
                            "couldn't parse package field 'info'",
                            err,
                        )
                    })?);
                }
                other => {
                    return Err(Error::msg(
                        ErrorKind::InvalidLockfile,
                        format!(
                            "encountered unexpected field '{other}' while parsing locked package"
                        ),
                    ));
                }
            }
        }
        Ok(LockedPackage {
            input: input.ok_or_else(|| {
                Error::msg(ErrorKind::InvalidLockfile, "locked package is missing 'input'")
            })?,
            attr_path: attr_path.ok_or_else(|| {
                Error::msg(ErrorKind::InvalidLockfile, "locked package is missing 'attr-path'")
            })?,
            priority: priority.unwrap_or(crate::descriptor::DEFAULT_PRIORITY),
            info: info.unwrap_or_default(),
        })
    }
}

/// Resolved packages for one system. An install id mapped to `None`
/// represents an optional descriptor that resolved to nothing, or a
/// descriptor whose `systems` excludes this system.
pub type SystemPackages = BTreeMap<InstallId, Option<LockedPackage>>;

/// An environment lockfile in its serialized shape.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LockfileRaw {
    pub manifest: ManifestRaw,
    pub registry: RegistryRaw,
    pub packages: BTreeMap<System, SystemPackages>,
    #[serde(rename = "lockfile-version")]
    pub lockfile_version: u64,
}

impl LockfileRaw {
    /// Parse the canonical (version 0) serialized form.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::msg(
                ErrorKind::InvalidLockfile,
                "lockfile must be an object",
            ));
        };
        let mut raw = LockfileRaw::default();
        for (key, value) in object {
            match key.as_str() {
                "manifest" => {
                    raw.manifest = ManifestRaw::from_value(value)
                        .map_err(|err| err.prefix_context("couldn't parse lockfile manifest"))?;
                }
                "registry" => {
                    raw.registry = serde_json::from_value(value.clone()).map_err(|err| {
                        Error::caught(
                            ErrorKind::InvalidLockfile,
                            "couldn't parse lockfile field 'registry'",
                            err,
                        )
                    })?;
                }
                "packages" => {
                    let Some(systems) = value.as_object() else {
                        return Err(Error::msg(
                            ErrorKind::InvalidLockfile,
                            "lockfile 'packages' field must be an object",
                        ));
                    };
                    for (system, descriptors) in systems {
                        let Some(descriptors) = descriptors.as_object() else {
                            return Err(Error::msg(
                                ErrorKind::InvalidLockfile,
                                format!("lockfile field 'packages.{system}' must be an object"),
                            ));
                        };
                        let mut system_packages = SystemPackages::new();
                        for (iid, locked) in descriptors {
                            let locked = match locked {
                                Value::Null => None,
                                other => Some(LockedPackage::from_value(other).map_err(|err| {
                                    err.prefix_context(format!(
                                        "couldn't parse lockfile field 'packages.{system}.{iid}'"
                                    ))
                                })?),
                            };
                            system_packages.insert(iid.clone(), locked);
                        }
                        raw.packages.insert(system.clone(), system_packages);
                    }
                }
                "lockfile-version" => {
                    raw.lockfile_version = value.as_u64().ok_or_else(|| {
                        Error::msg(
                            ErrorKind::InvalidLockfile,
                            "'lockfile-version' must be an integer",
                        )
                    })?;
                }
                other => {
                    return Err(Error::msg(
                        ErrorKind::InvalidLockfile,
                        format!("encountered unexpected field '{other}' while parsing lockfile"),
                    ));
                }
            }
        }
        Ok(raw)
    }

    /// The schema version must be the one this crate emits.
    pub fn check(&self) -> Result<()> {
        if self.lockfile_version != LOCKFILE_VERSION {
            return Err(Error::msg(
                ErrorKind::InvalidLockfile,
                format!("unsupported lockfile version {}", self.lockfile_version),
            ));
        }
        Ok(())
    }
}

/// A validated lockfile.
#[derive(Debug, Clone)]
pub struct Lockfile {
    raw: LockfileRaw,
    manifest: Manifest,
    /// Inputs used by locked packages, keyed by fingerprint.
    packages_registry: BTreeMap<String, LockedInput>,
}

impl PartialEq for Lockfile {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Serialize for Lockfile {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl Lockfile {
    /// Build from a raw lockfile without running [Lockfile::check]; the
    /// lifecycle prunes unused inputs before checking.
    pub fn from_raw(raw: LockfileRaw) -> Result<Self> {
        raw.check()?;
        let mut packages_registry = BTreeMap::new();
        for system_packages in raw.packages.values() {
            for locked in system_packages.values().flatten() {
                packages_registry
                    .entry(locked.input.fingerprint.clone())
                    .or_insert_with(|| locked.input.clone());
            }
        }
        let manifest = Manifest::from_raw(raw.manifest.clone())?;
        Ok(Lockfile {
            raw,
            manifest,
            packages_registry,
        })
    }

    /// Parse a serialized lockfile, dispatching on `lockfile-version`,
    /// and validate it.
    pub fn from_value(value: &Value) -> Result<Self> {
        let version = value
            .get("lockfile-version")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                Error::msg(
                    ErrorKind::InvalidLockfile,
                    "unsupported or missing 'lockfile-version'",
                )
            })?;
        let raw = match version {
            0 => LockfileRaw::from_value(value)?,
            1 => compat::lockfile_raw_from_v1(value)?,
            other => {
                return Err(Error::msg(
                    ErrorKind::InvalidLockfile,
                    format!("unsupported lockfile version {other}; only v0 and v1 are supported"),
                ));
            }
        };
        let lockfile = Self::from_raw(raw)?;
        lockfile.check()?;
        Ok(lockfile)
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::msg(
                ErrorKind::InvalidLockfile,
                format!("no such path: {}", path.display()),
            ));
        }
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::caught(
                ErrorKind::InvalidLockfile,
                format!("couldn't read {}", path.display()),
                err,
            )
        })?;
        let value: Value = serde_json::from_str(&contents).map_err(|err| {
            Error::caught(
                ErrorKind::InvalidLockfile,
                format!("couldn't parse {}", path.display()),
                err,
            )
        })?;
        Self::from_value(&value)
    }

    pub fn raw(&self) -> &LockfileRaw {
        &self.raw
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn registry_raw(&self) -> &RegistryRaw {
        &self.raw.registry
    }

    pub fn packages_registry(&self) -> &BTreeMap<String, LockedInput> {
        &self.packages_registry
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.raw).expect("lockfile serializes")
    }

    /// Validate the lockfile:
    /// - the schema version is supported,
    /// - no registry entry is indirect,
    /// - within each group, all locked packages for a system come from a
    ///   single input.
    pub fn check(&self) -> Result<()> {
        self.raw.check()?;
        if let Some(registry) = &self.raw.manifest.registry {
            for (name, input) in &registry.inputs {
                if input.from.is_indirect() {
                    return Err(Error::msg(
                        ErrorKind::InvalidLockfile,
                        format!("manifest 'registry.inputs.{name}.from' may not be indirect"),
                    ));
                }
            }
        }
        self.check_groups()
    }

    /// Groups must resolve within a single input per system.
    fn check_groups(&self) -> Result<()> {
        for (group, descriptors) in self.manifest.grouped_descriptors() {
            for system in self.manifest.systems() {
                let Some(system_packages) = self.raw.packages.get(&system) else {
                    continue;
                };
                let mut group_input: Option<&LockedInput> = None;
                for (iid, descriptor) in &descriptors {
                    if descriptor
                        .systems
                        .as_ref()
                        .is_some_and(|systems| !systems.contains(&system))
                    {
                        continue;
                    }
                    // Unresolved packages don't constrain the group.
                    let Some(Some(locked)) = system_packages.get(iid) else {
                        continue;
                    };
                    match group_input {
                        None => group_input = Some(&locked.input),
                        Some(input) if input.fingerprint == locked.input.fingerprint => {}
                        Some(_) => {
                            return Err(Error::msg(
                                ErrorKind::InvalidLockfile,
                                match &group {
                                    Some(group) => {
                                        format!("invalid group '{group}' uses multiple inputs")
                                    }
                                    None => "invalid toplevel group uses multiple inputs".to_string(),
                                },
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete registry entries referenced neither by the manifest
    /// registry nor by any locked package, pruning the priority list
    /// accordingly. Returns the number of removed entries.
    pub fn remove_unused_inputs(&mut self) -> usize {
        let manifest_names: Vec<String> = self
            .raw
            .manifest
            .registry
            .as_ref()
            .map(|registry| registry.inputs.keys().cloned().collect())
            .unwrap_or_default();
        let used_urls: Vec<&String> = self
            .packages_registry
            .values()
            .map(|input| &input.url)
            .collect();

        let unused: Vec<String> = self
            .raw
            .registry
            .inputs
            .iter()
            .filter(|(name, input)| {
                !manifest_names.contains(name)
                    && !input
                        .from
                        .url_string()
                        .is_ok_and(|url| used_urls.contains(&&url))
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &unused {
            self.raw.registry.inputs.remove(name);
            self.raw.registry.priority.retain(|entry| entry != name);
        }
        unused.len()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::registry::{RegistryInput, SourceRef};

    fn locked_input(rev: &str) -> Value {
        let url = format!("github:example/snapshot/{rev}");
        serde_json::json!({
            "fingerprint": keel_pkgdb::ref_fingerprint(&url),
            "url": url,
            "attrs": {
                "type": "github",
                "owner": "example",
                "repo": "snapshot",
                "rev": rev,
            },
        })
    }

    fn locked_package(rev: &str, attr: &str) -> Value {
        serde_json::json!({
            "input": locked_input(rev),
            "attr-path": ["legacyPackages", "x86_64-linux", attr],
            "priority": 5,
            "info": { "pname": attr, "version": "1.0.0" },
        })
    }

    const REV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const REV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn lockfile_value(a_rev: &str, b_rev: &str) -> Value {
        serde_json::json!({
            "lockfile-version": 0,
            "manifest": {
                "install": {
                    "a": { "package-group": "g" },
                    "b": { "package-group": "g" },
                },
                "options": { "systems": ["x86_64-linux"] },
            },
            "registry": {
                "inputs": {
                    "nixpkgs": { "from": format!("github:example/snapshot/{a_rev}") },
                },
                "priority": ["nixpkgs"],
            },
            "packages": {
                "x86_64-linux": {
                    "a": locked_package(a_rev, "a"),
                    "b": locked_package(b_rev, "b"),
                },
            },
        })
    }

    #[test]
    fn round_trips_canonical_lockfiles() {
        let value = lockfile_value(REV_A, REV_A);
        let lockfile = Lockfile::from_value(&value).unwrap();
        assert_eq!(lockfile.to_value(), value);
    }

    #[test]
    fn groups_mixing_inputs_are_rejected() {
        let err = Lockfile::from_value(&lockfile_value(REV_A, REV_B)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLockfile);
        assert!(err.to_string().contains("'g'"), "message was: {err}");
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut value = lockfile_value(REV_A, REV_A);
        value["lockfile-version"] = serde_json::json!(7);
        let err = Lockfile::from_value(&value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLockfile);
    }

    #[test]
    fn malformed_fingerprints_are_rejected() {
        let mut value = lockfile_value(REV_A, REV_A);
        value["packages"]["x86_64-linux"]["a"]["input"]["fingerprint"] =
            serde_json::json!("not-a-fingerprint");
        let err = Lockfile::from_value(&value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHash);
    }

    #[test]
    fn unexpected_fields_are_rejected() {
        let mut value = lockfile_value(REV_A, REV_A);
        value["surprise"] = serde_json::json!(true);
        assert!(Lockfile::from_value(&value).is_err());

        let mut value = lockfile_value(REV_A, REV_A);
        value["packages"]["x86_64-linux"]["a"]["surprise"] = serde_json::json!(true);
        assert!(Lockfile::from_value(&value).is_err());
    }

    #[test]
    fn prunes_unreferenced_inputs() {
        let mut lockfile = Lockfile::from_value(&lockfile_value(REV_A, REV_A)).unwrap();
        // An input that neither the manifest nor any package references.
        lockfile.raw.registry.inputs.insert(
            "stale".to_string(),
            RegistryInput::new(SourceRef::Url(format!("github:example/other/{REV_B}"))),
        );
        lockfile.raw.registry.priority.push("stale".to_string());

        assert_eq!(lockfile.remove_unused_inputs(), 1);
        assert!(!lockfile.raw.registry.inputs.contains_key("stale"));
        assert!(!lockfile.raw.registry.priority.contains(&"stale".to_string()));
        // The input used by the locked packages stays.
        assert_eq!(lockfile.remove_unused_inputs(), 0);
        assert!(lockfile.raw.registry.inputs.contains_key("nixpkgs"));
    }
}
