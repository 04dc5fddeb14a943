//! Validated environment descriptions.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::{InstallId, System};
use keel_core::util::read_to_json;
use keel_pkgdb::PkgQueryArgs;

use crate::descriptor::{GroupName, ManifestDescriptor};
use crate::manifest_raw::{GlobalManifestRaw, ManifestRaw};
use crate::registry::RegistryRaw;

/// A map of install ids to descriptors.
pub type InstallDescriptors = BTreeMap<InstallId, ManifestDescriptor>;

/// A user level manifest supplying registry and option defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalManifest {
    raw: GlobalManifestRaw,
}

impl GlobalManifest {
    pub fn from_raw(raw: GlobalManifestRaw) -> Result<Self> {
        raw.check()?;
        Ok(GlobalManifest { raw })
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Self::from_raw(GlobalManifestRaw::from_value(value)?)
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let value = read_to_json(path.as_ref())
            .map_err(|err| err.prefix_context("couldn't load global manifest"))?;
        Self::from_value(&value)
    }

    pub fn raw(&self) -> &GlobalManifestRaw {
        &self.raw
    }

    pub fn registry_raw(&self) -> RegistryRaw {
        self.raw.registry.clone().unwrap_or_default()
    }
}

/// A validated environment description with its canonical descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    raw: ManifestRaw,
    descriptors: InstallDescriptors,
    /// Group names in first-appearance order of the `install` table,
    /// with `None` naming the implicit default bucket.
    group_order: Vec<Option<GroupName>>,
}

impl Manifest {
    pub fn from_raw(raw: ManifestRaw) -> Result<Self> {
        raw.check()?;

        let mut descriptors = InstallDescriptors::new();
        let mut group_order: Vec<Option<GroupName>> = Vec::new();
        for (iid, maybe_raw) in raw.install.iter().flat_map(IndexMap::iter) {
            let descriptor = match maybe_raw {
                Some(descriptor_raw) => ManifestDescriptor::from_raw(iid, descriptor_raw)
                    .map_err(|err| err.prefix_context(format!("install.{iid}")))?,
                None => ManifestDescriptor {
                    name: Some(iid.clone()),
                    ..ManifestDescriptor::default()
                },
            };
            descriptor.check()?;
            if !group_order.contains(&descriptor.group) {
                group_order.push(descriptor.group.clone());
            }
            descriptors.insert(iid.clone(), descriptor);
        }

        let manifest = Manifest {
            raw,
            descriptors,
            group_order,
        };
        manifest.check()?;
        Ok(manifest)
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Self::from_raw(ManifestRaw::from_value(value)?)
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let value = read_to_json(path.as_ref())
            .map_err(|err| err.prefix_context("couldn't load manifest"))?;
        Self::from_value(&value)
    }

    /// Descriptor `systems` must be listed in `options.systems`.
    fn check(&self) -> Result<()> {
        let declared = self
            .raw
            .options
            .as_ref()
            .and_then(|options| options.systems.as_ref());
        for (iid, descriptor) in &self.descriptors {
            let Some(systems) = &descriptor.systems else {
                continue;
            };
            let Some(declared) = declared else {
                return Err(Error::msg(
                    ErrorKind::InvalidManifestFile,
                    format!(
                        "descriptor 'install.{iid}' specifies 'systems' but the manifest \
                         has no 'options.systems'"
                    ),
                ));
            };
            for system in systems {
                if !declared.contains(system) {
                    return Err(Error::msg(
                        ErrorKind::InvalidManifestFile,
                        format!(
                            "descriptor 'install.{iid}' specifies system '{system}' which is \
                             not in 'options.systems'"
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn raw(&self) -> &ManifestRaw {
        &self.raw
    }

    pub fn descriptors(&self) -> &InstallDescriptors {
        &self.descriptors
    }

    pub fn registry_raw(&self) -> RegistryRaw {
        self.raw.registry.clone().unwrap_or_default()
    }

    pub fn systems(&self) -> Vec<System> {
        self.raw.systems()
    }

    /// All descriptors, bucketed by group. Descriptors without a group
    /// share the implicit default bucket; buckets appear in
    /// first-appearance order of the `install` table.
    pub fn grouped_descriptors(&self) -> Vec<(Option<GroupName>, InstallDescriptors)> {
        let mut buckets: Vec<(Option<GroupName>, InstallDescriptors)> = self
            .group_order
            .iter()
            .map(|group| (group.clone(), InstallDescriptors::new()))
            .collect();
        for (iid, descriptor) in &self.descriptors {
            let bucket = buckets
                .iter_mut()
                .find(|(group, _)| group == &descriptor.group)
                .expect("every group has a bucket");
            bucket.1.insert(iid.clone(), descriptor.clone());
        }
        buckets
    }

    /// A base set of query args derived from the manifest's options.
    pub fn base_query_args(&self) -> PkgQueryArgs {
        options_query_args(self.raw.options.as_ref())
    }
}

/// Convert an options block into a base set of query args.
pub fn options_query_args(options: Option<&crate::manifest_raw::Options>) -> PkgQueryArgs {
    let mut args = PkgQueryArgs::default();
    let Some(options) = options else {
        return args;
    };
    if let Some(systems) = &options.systems {
        args.systems = systems.clone();
    }
    if let Some(allow) = &options.allow {
        if let Some(unfree) = allow.unfree {
            args.allow_unfree = unfree;
        }
        if let Some(broken) = allow.broken {
            args.allow_broken = broken;
        }
        args.licenses = allow.licenses.clone();
    }
    if let Some(semver) = &options.semver {
        if let Some(prefer) = semver.prefer_pre_releases {
            args.prefer_pre_releases = prefer;
        }
    }
    args
}
