//! The serialized form of an environment description.
//!
//! These structs represent what is considered valid on disk; they perform
//! no work beyond validating input. The validated forms live in
//! [crate::manifest].

use std::collections::BTreeMap;

use indexmap::IndexMap;
use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::{InstallId, System, current_system, is_supported_system};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::descriptor::ManifestDescriptorRaw;
use crate::registry::RegistryRaw;

/// Allow-rules for license, broken, and unfree packages.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Allows {
    pub unfree: Option<bool>,
    pub broken: Option<bool>,
    pub licenses: Option<Vec<String>>,
}

/// Semantic version selection behavior.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SemverOptions {
    #[serde(rename = "prefer-pre-releases")]
    pub prefer_pre_releases: Option<bool>,
}

/// Options that apply to an entire environment.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Options {
    pub systems: Option<Vec<System>>,
    pub allow: Option<Allows>,
    pub semver: Option<SemverOptions>,
}

impl Options {
    /// Apply options from `overrides`, retaining existing options they
    /// don't touch.
    pub fn merge(&mut self, overrides: &Options) {
        if let Some(systems) = &overrides.systems {
            self.systems = Some(systems.clone());
        }
        if let Some(allow) = &overrides.allow {
            let base = self.allow.get_or_insert_with(Allows::default);
            if let Some(unfree) = allow.unfree {
                base.unfree = Some(unfree);
            }
            if let Some(broken) = allow.broken {
                base.broken = Some(broken);
            }
            if let Some(licenses) = &allow.licenses {
                base.licenses = Some(licenses.clone());
            }
        }
        if let Some(semver) = &overrides.semver {
            let base = self.semver.get_or_insert_with(SemverOptions::default);
            if let Some(prefer) = semver.prefer_pre_releases {
                base.prefer_pre_releases = Some(prefer);
            }
        }
    }
}

/// Scripts sourced by the user's interactive shell after activation,
/// keyed by shell.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileScriptsRaw {
    /// Sourced by all shells.
    pub common: Option<String>,
    pub bash: Option<String>,
    pub fish: Option<String>,
    pub tcsh: Option<String>,
    pub zsh: Option<String>,
}

/// A hook run at environment activation.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HookRaw {
    /// An inline script sourced at activation time.
    pub script: Option<String>,
    /// An inline script run non-interactively from a subshell after the
    /// user's profile scripts have been sourced.
    #[serde(rename = "on-activate")]
    pub on_activate: Option<String>,
}

impl HookRaw {
    pub fn check(&self) -> Result<()> {
        if self.script.is_some() && self.on_activate.is_some() {
            return Err(Error::msg(
                ErrorKind::InvalidManifestFile,
                "hook may define only one of 'script' or 'on-activate'",
            ));
        }
        Ok(())
    }
}

/// A build command associated with a named artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildDescriptorRaw {
    pub command: String,
}

fn check_options(options: &Options) -> Result<()> {
    if let Some(systems) = &options.systems {
        if systems.is_empty() {
            return Err(Error::msg(
                ErrorKind::InvalidManifestFile,
                "'options.systems' may not be empty",
            ));
        }
        for system in systems {
            if !is_supported_system(system) {
                return Err(Error::msg(
                    ErrorKind::InvalidManifestFile,
                    format!("'options.systems' contains unsupported system '{system}'"),
                ));
            }
        }
    }
    Ok(())
}

fn check_registry(registry: &RegistryRaw) -> Result<()> {
    for (name, input) in &registry.inputs {
        if input.from.is_indirect() {
            return Err(Error::msg(
                ErrorKind::InvalidManifestFile,
                format!("manifest 'registry.inputs.{name}.from' may not be indirect"),
            ));
        }
    }
    Ok(())
}

fn field<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|err| {
        Error::caught(
            ErrorKind::InvalidManifestFile,
            format!("couldn't interpret field '{key}'"),
            err,
        )
    })
}

/// A user level manifest containing only `registry` and `options`,
/// used to supply defaults outside any particular environment.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GlobalManifestRaw {
    pub registry: Option<RegistryRaw>,
    pub options: Option<Options>,
}

impl GlobalManifestRaw {
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::msg(
                ErrorKind::InvalidManifestFile,
                "manifest must be an object",
            ));
        };
        let mut raw = GlobalManifestRaw::default();
        for (key, value) in object {
            match key.as_str() {
                "registry" => raw.registry = Some(field(key, value)?),
                "options" => raw.options = Some(field(key, value)?),
                other => {
                    return Err(Error::msg(
                        ErrorKind::InvalidManifestFile,
                        format!("encountered unrecognized field '{other}'"),
                    ));
                }
            }
        }
        raw.check()?;
        Ok(raw)
    }

    pub fn check(&self) -> Result<()> {
        if let Some(registry) = &self.registry {
            check_registry(registry)?;
        }
        if let Some(options) = &self.options {
            check_options(options)?;
        }
        Ok(())
    }

    /// The systems requested by the manifest, defaulting to the
    /// current one.
    pub fn systems(&self) -> Vec<System> {
        self.options
            .as_ref()
            .and_then(|options| options.systems.clone())
            .unwrap_or_else(|| vec![current_system()])
    }
}

/// The serialized form of an environment description.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ManifestRaw {
    pub install: Option<IndexMap<InstallId, Option<ManifestDescriptorRaw>>>,
    pub registry: Option<RegistryRaw>,
    pub options: Option<Options>,
    pub vars: Option<BTreeMap<String, String>>,
    pub profile: Option<ProfileScriptsRaw>,
    pub hook: Option<HookRaw>,
    pub build: Option<BTreeMap<String, BuildDescriptorRaw>>,
}

fn parse_install(
    value: &Value,
) -> Result<IndexMap<InstallId, Option<ManifestDescriptorRaw>>> {
    let Some(object) = value.as_object() else {
        return Err(Error::msg(
            ErrorKind::InvalidManifestFile,
            "'install' must be a table",
        ));
    };
    let mut install = IndexMap::new();
    for (iid, descriptor) in object {
        let parsed = match descriptor {
            // An empty descriptor resolves by the install id itself.
            Value::Null => None,
            Value::String(compact) => Some(
                compact
                    .parse::<ManifestDescriptorRaw>()
                    .map_err(|err| err.prefix_context(format!("install.{iid}")))?,
            ),
            other => Some(
                ManifestDescriptorRaw::from_value(other)
                    .map_err(|err| err.prefix_context(format!("install.{iid}")))?,
            ),
        };
        install.insert(iid.clone(), parsed);
    }
    Ok(install)
}

impl ManifestRaw {
    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::msg(
                ErrorKind::InvalidManifestFile,
                "manifest must be an object",
            ));
        };
        let mut raw = ManifestRaw::default();
        for (key, value) in object {
            match key.as_str() {
                "install" => raw.install = Some(parse_install(value)?),
                "registry" => raw.registry = Some(field(key, value)?),
                "options" => raw.options = Some(field(key, value)?),
                "vars" => raw.vars = Some(field(key, value)?),
                "profile" => raw.profile = Some(field(key, value)?),
                "hook" => raw.hook = Some(field(key, value)?),
                "build" => raw.build = Some(field(key, value)?),
                other => {
                    return Err(Error::msg(
                        ErrorKind::InvalidManifestFile,
                        format!("encountered unrecognized field '{other}'"),
                    ));
                }
            }
        }
        raw.check()?;
        Ok(raw)
    }

    /// Validate manifest fields:
    /// - the registry contains no indirect references,
    /// - `options.systems` is a non-empty subset of the supported set,
    /// - every install descriptor is internally consistent,
    /// - the hook defines at most one script.
    pub fn check(&self) -> Result<()> {
        if let Some(registry) = &self.registry {
            check_registry(registry)?;
        }
        if let Some(options) = &self.options {
            check_options(options)?;
        }
        if let Some(install) = &self.install {
            for (iid, descriptor) in install {
                if let Some(descriptor) = descriptor {
                    descriptor.check(iid)?;
                }
            }
        }
        if let Some(hook) = &self.hook {
            hook.check()?;
        }
        Ok(())
    }

    /// The systems requested by the manifest, defaulting to the
    /// current one.
    pub fn systems(&self) -> Vec<System> {
        self.options
            .as_ref()
            .and_then(|options| options.systems.clone())
            .unwrap_or_else(|| vec![current_system()])
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn manifest(value: serde_json::Value) -> Result<ManifestRaw> {
        ManifestRaw::from_value(&value)
    }

    #[test]
    fn parses_a_full_manifest() {
        let raw = manifest(serde_json::json!({
            "install": {
                "hello": {},
                "ripgrep": { "version": "^14", "package-group": "tools" },
                "bat": "nixpkgs:bat@0.24.0",
                "implicit": null,
            },
            "registry": {
                "inputs": {
                    "nixpkgs": { "from": "github:example/snapshot/main" },
                },
                "priority": ["nixpkgs"],
            },
            "options": {
                "systems": ["x86_64-linux", "aarch64-darwin"],
                "allow": { "unfree": false, "licenses": ["MIT"] },
                "semver": { "prefer-pre-releases": true },
            },
            "vars": { "EDITOR": "vim" },
            "profile": { "common": "echo hi" },
            "hook": { "on-activate": "true" },
            "build": { "app": { "command": "make" } },
        }))
        .unwrap();

        assert_eq!(raw.systems(), vec!["x86_64-linux", "aarch64-darwin"]);

        let install = raw.install.unwrap();
        assert_eq!(install.len(), 4);
        assert!(install["implicit"].is_none());
        let ripgrep = install["ripgrep"].as_ref().unwrap();
        assert_eq!(ripgrep.package_group.as_deref(), Some("tools"));
        let bat = install["bat"].as_ref().unwrap();
        assert_eq!(bat.version.as_deref(), Some("0.24.0"));

        assert_eq!(raw.vars.unwrap()["EDITOR"], "vim");
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let err = manifest(serde_json::json!({ "isntall": {} })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifestFile);
    }

    #[test]
    fn rejects_unknown_descriptor_keys() {
        let err = manifest(serde_json::json!({
            "install": { "hello": { "nmae": "hello" } },
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseDescriptor);
    }

    #[test]
    fn rejects_both_hook_forms() {
        let err = manifest(serde_json::json!({
            "hook": { "script": "a", "on-activate": "b" },
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifestFile);
    }

    #[test]
    fn rejects_indirect_registry_inputs() {
        let err = manifest(serde_json::json!({
            "registry": { "inputs": { "nixpkgs": { "from": "nixpkgs" } } },
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifestFile);
    }

    #[test]
    fn rejects_empty_or_unsupported_systems() {
        let err = manifest(serde_json::json!({ "options": { "systems": [] } })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifestFile);

        let err = manifest(serde_json::json!({
            "options": { "systems": ["riscv64-linux"] },
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidManifestFile);
    }

    #[test]
    fn merges_options() {
        let mut base: Options = serde_json::from_value(serde_json::json!({
            "systems": ["x86_64-linux"],
            "allow": { "unfree": true, "broken": false },
        }))
        .unwrap();
        let overrides: Options = serde_json::from_value(serde_json::json!({
            "allow": { "unfree": false },
            "semver": { "prefer-pre-releases": true },
        }))
        .unwrap();
        base.merge(&overrides);
        assert_eq!(base.systems, Some(vec!["x86_64-linux".to_string()]));
        let allow = base.allow.unwrap();
        assert_eq!(allow.unfree, Some(false));
        assert_eq!(allow.broken, Some(false));
        assert_eq!(base.semver.unwrap().prefer_pre_releases, Some(true));
    }

    #[test]
    fn global_manifest_accepts_only_registry_and_options() {
        let raw = GlobalManifestRaw::from_value(&serde_json::json!({
            "registry": {
                "inputs": { "nixpkgs": { "from": "github:example/snapshot/main" } },
            },
        }))
        .unwrap();
        assert!(raw.registry.is_some());

        let err = GlobalManifestRaw::from_value(&serde_json::json!({ "install": {} }));
        assert!(err.is_err());
    }
}
