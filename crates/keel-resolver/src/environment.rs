//! Group-based resolution and the lockfile lifecycle.
//!
//! Descriptors are bucketed by group; each bucket must resolve within a
//! single input per system. Buckets whose descriptors are unchanged from
//! the prior lockfile carry their pins forward; the rest are resolved
//! against the merged registry's inputs in order, starting from the
//! input the prior lockfile pinned for the group, when one exists.

use std::collections::BTreeMap;
use std::path::PathBuf;

use itertools::Itertools;
use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::{InstallId, Subtree, System};
use keel_pkgdb::{PkgDb, PkgQuery, PkgQueryArgs, RowId, db_path};
use tracing::debug;

use crate::descriptor::{GroupName, ManifestDescriptor};
use crate::lockfile::{
    LOCKFILE_VERSION, LockedInput, LockedPackage, Lockfile, LockfileRaw, PackageInfo,
    SystemPackages,
};
use crate::manifest::{GlobalManifest, InstallDescriptors, Manifest, options_query_args};
use crate::manifest_raw::Options;
use crate::registry::{InputName, RegistryRaw};

/// Which locked groups an upgrade request forces open.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Upgrades {
    /// Re-resolve every group.
    All,
    /// Don't force any group open.
    #[default]
    None,
    /// Re-resolve every group containing one of these install ids.
    Ids(Vec<InstallId>),
}

impl Upgrades {
    fn forces_unlock(&self, group: &InstallDescriptors) -> bool {
        match self {
            Upgrades::All => true,
            Upgrades::None => false,
            Upgrades::Ids(ids) => group.keys().any(|iid| ids.contains(iid)),
        }
    }
}

/// A descriptor skips a system when it names systems and that system
/// isn't one of them.
fn system_skipped(system: &System, systems: &Option<Vec<System>>) -> bool {
    systems
        .as_ref()
        .is_some_and(|systems| !systems.contains(system))
}

/// A registry input with its opened index.
struct ResolverInput {
    name: InputName,
    subtrees: Option<Vec<Subtree>>,
    locked: LockedInput,
    db: PkgDb,
}

impl ResolverInput {
    fn fill_query_args(&self, args: &mut PkgQueryArgs) {
        if let Some(subtrees) = &self.subtrees {
            args.subtrees = Some(subtrees.clone());
        }
    }
}

/// Failed `(install id, input url)` attempts for one bucket.
type FailedAttempts = Vec<(InstallId, String)>;

enum GroupResolution {
    Resolved(SystemPackages),
    Failure(FailedAttempts),
}

/// An environment's manifests and prior lockfile, and the state needed
/// to produce a new lockfile from them.
pub struct Environment {
    global_manifest: Option<GlobalManifest>,
    manifest: Manifest,
    old_lockfile: Option<Lockfile>,
    upgrades: Upgrades,
    cache_dir: PathBuf,
    combined_registry: Option<RegistryRaw>,
    combined_options: Option<Options>,
    inputs: Option<Vec<ResolverInput>>,
}

impl Environment {
    pub fn new(
        global_manifest: Option<GlobalManifest>,
        manifest: Manifest,
        old_lockfile: Option<Lockfile>,
        upgrades: Upgrades,
    ) -> Self {
        Environment {
            global_manifest,
            manifest,
            old_lockfile,
            upgrades,
            cache_dir: keel_pkgdb::cache_dir(),
            combined_registry: None,
            combined_options: None,
            inputs: None,
        }
    }

    /// Override the directory index files are looked up in.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn old_lockfile(&self) -> Option<&Lockfile> {
        self.old_lockfile.as_ref()
    }

    /// The merged registry: the global manifest's registry (if any),
    /// overridden by the prior lockfile's pins, overridden by the
    /// environment manifest's registry. Entries the manifest dropped
    /// survive only until [Lockfile::remove_unused_inputs] runs.
    pub fn combined_registry(&mut self) -> &RegistryRaw {
        if self.combined_registry.is_none() {
            let mut combined = self
                .global_manifest
                .as_ref()
                .map(GlobalManifest::registry_raw)
                .unwrap_or_default();
            if let Some(old_lockfile) = &self.old_lockfile {
                combined.merge(old_lockfile.registry_raw());
            }
            combined.merge(&self.manifest.registry_raw());
            self.combined_registry = Some(combined);
        }
        self.combined_registry.as_ref().unwrap()
    }

    /// Merged options: global clobbered by the prior lockfile's
    /// manifest, clobbered by the current manifest.
    fn combined_options(&mut self) -> &Options {
        if self.combined_options.is_none() {
            let mut options = self
                .global_manifest
                .as_ref()
                .and_then(|global| global.raw().options.clone())
                .unwrap_or_default();
            if let Some(old_options) = self
                .old_lockfile
                .as_ref()
                .and_then(|old| old.manifest().raw().options.as_ref())
            {
                options.merge(old_options);
            }
            if let Some(manifest_options) = &self.manifest.raw().options {
                options.merge(manifest_options);
            }
            self.combined_options = Some(options);
        }
        self.combined_options.as_ref().unwrap()
    }

    /// Open an index for every input in the merged registry, in
    /// registry order.
    fn open_inputs(&mut self) -> Result<()> {
        if self.inputs.is_some() {
            return Ok(());
        }
        let registry = self.combined_registry().clone();
        let mut inputs = Vec::new();
        for name in registry.order() {
            let entry = &registry.inputs[&name];
            let locked = entry
                .from
                .lock()
                .map_err(|err| err.prefix_context(format!("couldn't lock input '{name}'")))?;
            let db = PkgDb::open(db_path(&locked.fingerprint, &self.cache_dir))
                .map_err(|err| err.prefix_context(format!("couldn't open input '{name}'")))?;
            debug!(input = %name, url = %locked.url, "opened package index");
            inputs.push(ResolverInput {
                name,
                subtrees: entry.subtrees.clone(),
                locked,
                db,
            });
        }
        self.inputs = Some(inputs);
        Ok(())
    }

    /// Whether a bucket's prior pins can be carried forward without
    /// re-resolving.
    fn group_is_locked(&self, group: &InstallDescriptors, system: &System) -> bool {
        let Some(old_lockfile) = &self.old_lockfile else {
            return false;
        };
        if self.upgrades.forces_unlock(group) {
            return false;
        }
        let Some(old_system) = old_lockfile.raw().packages.get(system) else {
            return false;
        };
        let old_descriptors = old_lockfile.manifest().descriptors();

        for (iid, descriptor) in group {
            let Some(old_descriptor) = old_descriptors.get(iid) else {
                return false;
            };

            // A change to any of these fields changes what the package
            // *is*, invalidating the old lock.
            if descriptor.name != old_descriptor.name
                || descriptor.path != old_descriptor.path
                || descriptor.version != old_descriptor.version
                || descriptor.semver != old_descriptor.semver
                || descriptor.subtree != old_descriptor.subtree
                || descriptor.input != old_descriptor.input
                || descriptor.group != old_descriptor.group
                || descriptor.optional != old_descriptor.optional
            {
                return false;
            }

            // `priority` and `systems` don't affect resolution, except
            // that including or excluding the system being locked does.
            if system_skipped(system, &descriptor.systems)
                != system_skipped(system, &old_descriptor.systems)
            {
                return false;
            }

            if !old_system.contains_key(iid) {
                return false;
            }
        }
        true
    }

    /// The locked input to try first for a group, when the prior
    /// lockfile pinned one.
    ///
    /// An unchanged member whose group name changed still seeds the
    /// preferred input: when groups are renamed or combined we want to
    /// reuse their old pins rather than drift to a new snapshot.
    fn group_input(&self, group: &InstallDescriptors, system: &System) -> Option<LockedInput> {
        let old_lockfile = self.old_lockfile.as_ref()?;
        let old_system = old_lockfile.raw().packages.get(system)?;
        let old_descriptors = old_lockfile.manifest().descriptors();

        let mut wrong_group_input = None;
        for (iid, descriptor) in group {
            let Some(Some(locked)) = old_system.get(iid) else {
                continue;
            };
            let Some(old_descriptor) = old_descriptors.get(iid) else {
                continue;
            };
            // Don't reuse the input of a package that has changed.
            if descriptor.name == old_descriptor.name
                && descriptor.path == old_descriptor.path
                && descriptor.version == old_descriptor.version
                && descriptor.semver == old_descriptor.semver
                && descriptor.subtree == old_descriptor.subtree
                && descriptor.input == old_descriptor.input
            {
                if descriptor.group == old_descriptor.group {
                    return Some(locked.input.clone());
                }
                if wrong_group_input.is_none() {
                    wrong_group_input = Some(locked.input.clone());
                }
            }
        }
        wrong_group_input
    }

    /// Try to resolve one descriptor in one input, returning the top
    /// ranked candidate.
    fn try_resolve_descriptor_in(
        &self,
        descriptor: &ManifestDescriptor,
        input: &ResolverInput,
        system: &System,
        base_args: &PkgQueryArgs,
    ) -> Result<Option<RowId>> {
        let mut args = base_args.clone();
        input.fill_query_args(&mut args);
        descriptor.fill_query_args(&mut args);
        // Limit results to the target system.
        args.systems = vec![system.clone()];
        let rows = PkgQuery::new(args)?.execute(&input.db)?;
        Ok(rows.into_iter().next())
    }

    /// Try to resolve a whole bucket in one input. Every non-optional
    /// member must resolve there; the first member that doesn't is
    /// returned as the failure.
    fn try_resolve_group_in(
        &self,
        group: &InstallDescriptors,
        input: &ResolverInput,
        system: &System,
        base_args: &PkgQueryArgs,
    ) -> Result<std::result::Result<SystemPackages, InstallId>> {
        let mut rows: BTreeMap<InstallId, Option<RowId>> = BTreeMap::new();
        for (iid, descriptor) in group {
            if system_skipped(system, &descriptor.systems) {
                rows.insert(iid.clone(), None);
                continue;
            }
            let maybe_row = self.try_resolve_descriptor_in(descriptor, input, system, base_args)?;
            if maybe_row.is_none() && !descriptor.optional {
                return Ok(Err(iid.clone()));
            }
            rows.insert(iid.clone(), maybe_row);
        }

        let mut packages = SystemPackages::new();
        for (iid, maybe_row) in rows {
            let locked = match maybe_row {
                Some(row) => Some(lock_package(
                    &input.locked,
                    &input.db,
                    row,
                    group[&iid].priority,
                )?),
                None => None,
            };
            packages.insert(iid, locked);
        }
        Ok(Ok(packages))
    }

    /// Resolve a bucket: the prior lockfile's pinned input first (when
    /// it is still in the registry), then every input in registry order.
    fn try_resolve_group(
        &self,
        group: &InstallDescriptors,
        system: &System,
        base_args: &PkgQueryArgs,
    ) -> Result<GroupResolution> {
        let inputs = self.inputs.as_deref().expect("inputs are opened");
        let mut attempts = FailedAttempts::new();
        let mut tried = None;

        if let Some(preferred) = self.group_input(group, system) {
            if let Some(input) = inputs
                .iter()
                .find(|input| input.locked.same_input(&preferred))
            {
                debug!(input = %input.name, %system, "trying group against its pinned input");
                match self.try_resolve_group_in(group, input, system, base_args)? {
                    Ok(resolved) => return Ok(GroupResolution::Resolved(resolved)),
                    Err(iid) => {
                        attempts.push((iid, input.locked.url.clone()));
                        tried = Some(input.locked.fingerprint.clone());
                    }
                }
            }
        }

        for input in inputs {
            if tried.as_deref() == Some(input.locked.fingerprint.as_str()) {
                continue;
            }
            debug!(input = %input.name, %system, "trying group");
            match self.try_resolve_group_in(group, input, system, base_args)? {
                Ok(resolved) => return Ok(GroupResolution::Resolved(resolved)),
                Err(iid) => attempts.push((iid, input.locked.url.clone())),
            }
        }
        Ok(GroupResolution::Failure(attempts))
    }

    /// Lock all buckets for one system.
    fn lock_system(&self, system: &System, base_args: &PkgQueryArgs) -> Result<SystemPackages> {
        let mut packages = SystemPackages::new();
        let mut failures: Vec<(Option<GroupName>, FailedAttempts)> = Vec::new();

        for (group_name, group) in self.manifest.grouped_descriptors() {
            if self.group_is_locked(&group, system) {
                debug!(group = group_name.as_deref().unwrap_or("default"), %system, "reusing locks");
                continue;
            }
            match self.try_resolve_group(&group, system, base_args)? {
                GroupResolution::Resolved(resolved) => packages.extend(resolved),
                GroupResolution::Failure(attempts) => failures.push((group_name, attempts)),
            }
        }

        // Every failing bucket is reported, with every attempt it made.
        if !failures.is_empty() {
            let buckets = failures
                .iter()
                .map(|(group, attempts)| {
                    let heading = match group {
                        Some(group) => format!("  in group '{group}':"),
                        None => "  in default group:".to_string(),
                    };
                    if attempts.is_empty() {
                        return format!("{heading}\n    no inputs found to search for packages");
                    }
                    let lines = attempts
                        .iter()
                        .map(|(iid, url)| {
                            format!("    failed to resolve '{iid}' in input '{url}'")
                        })
                        .join("\n");
                    format!("{heading}\n{lines}")
                })
                .join("\n");
            return Err(Error::msg(
                ErrorKind::ResolutionFailure,
                format!("failed to resolve some package(s):\n{buckets}"),
            ));
        }

        // Carry over prior pins for locked buckets, refreshing their
        // priority from the current manifest.
        if let Some(old_system) = self
            .old_lockfile
            .as_ref()
            .and_then(|old| old.raw().packages.get(system))
        {
            for (_, group) in self.manifest.grouped_descriptors() {
                if !self.group_is_locked(&group, system) {
                    continue;
                }
                for (iid, descriptor) in &group {
                    if let Some(old_locked) = old_system.get(iid) {
                        let mut locked = old_locked.clone();
                        if let Some(locked) = &mut locked {
                            locked.priority = descriptor.priority;
                        }
                        packages.insert(iid.clone(), locked);
                    }
                }
            }
        }

        Ok(packages)
    }

    /// Produce a new lockfile from the manifest, prior lockfile, and
    /// upgrade request. Persistence is the caller's responsibility.
    pub fn create_lockfile(&mut self) -> Result<Lockfile> {
        let registry = self.combined_registry().clone();
        let base_args = options_query_args(Some(self.combined_options()));
        self.open_inputs()?;

        let mut raw = LockfileRaw {
            manifest: self.manifest.raw().clone(),
            registry,
            packages: BTreeMap::new(),
            lockfile_version: LOCKFILE_VERSION,
        };
        for system in self.manifest.systems() {
            let packages = self.lock_system(&system, &base_args)?;
            raw.packages.insert(system, packages);
        }

        let mut lockfile = Lockfile::from_raw(raw)?;
        let removed = lockfile.remove_unused_inputs();
        if removed > 0 {
            debug!(removed, "removed unused registry inputs");
        }
        lockfile.check()?;
        Ok(lockfile)
    }
}

/// Pin one resolved row from an index.
fn lock_package(
    input: &LockedInput,
    db: &PkgDb,
    row: RowId,
    priority: u32,
) -> Result<LockedPackage> {
    let package = db.get_package(row)?;
    let pname = package
        .pname
        .or_else(|| package.rel_path.last().cloned())
        .unwrap_or_default();
    Ok(LockedPackage {
        input: input.clone(),
        attr_path: package.abs_path,
        priority,
        info: PackageInfo {
            pname,
            version: package.version,
            description: package.description,
            license: package.license,
            broken: package.broken,
            unfree: package.unfree,
        },
    })
}
