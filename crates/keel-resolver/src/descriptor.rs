//! User-authored package requirements.
//!
//! A descriptor may be written as a table with explicit fields or as a
//! compact string:
//!
//! ```text
//! [<input>:]((<attr>.)+<attrName>)|(<pname>|<attrName>|<name>)[@(<range>|=<version>)]
//! ```
//!
//! The raw form mirrors what users write; [ManifestDescriptor] is the
//! canonical in-memory form consumed by the resolver.

use std::str::FromStr;

use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::{AttrPath, AttrPathGlob, Subtree, System};
use keel_core::util::{display_globbed_path, split_attr_path, trim_copy};
use keel_core::versions;
use keel_pkgdb::PkgQueryArgs;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::registry::SourceRef;

/// A named group which a descriptor can be a member of.
pub type GroupName = String;

/// The delimiter for providing an input in the string form.
pub const INPUT_SIGIL: char = ':';
/// The delimiter for specifying a version in the string form.
pub const VERSION_SIGIL: char = '@';
/// Marks a version as exact rather than a range.
pub const EXACT_VERSION_SIGIL: char = '=';

/// Default priority for packages when handling conflicting files.
/// Higher values win.
pub const DEFAULT_PRIORITY: u32 = 5;

/// A relative attribute path, dotted or in list form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DescriptorPath {
    Parts(AttrPath),
    Dotted(String),
}

/// An absolute attribute path which may glob its system element,
/// dotted or in list form. `null` list members represent globs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DescriptorAbsPath {
    Parts(AttrPathGlob),
    Dotted(String),
}

/// A descriptor as written by the user.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ManifestDescriptorRaw {
    /// Match `name`, `pname`, or `attrName`.
    pub name: Option<String>,

    /// Match an exact version or a semantic version range.
    ///
    /// Strings beginning with `=` filter by exact match on `version`;
    /// strings interpretable as a range filter by range; everything else
    /// filters by exact match.
    pub version: Option<String>,

    /// Match a relative path.
    pub path: Option<DescriptorPath>,

    /// Match an absolute path, allowing a glob for `system`.
    pub abspath: Option<DescriptorAbsPath>,

    /// Only resolve for the given systems.
    pub systems: Option<Vec<System>>,

    /// Whether resolution is allowed to fail without producing errors.
    pub optional: Option<bool>,

    /// Named group the package is a member of.
    pub package_group: Option<GroupName>,

    /// Force resolution in the named input or source reference.
    pub package_repository: Option<SourceRef>,

    /// Rank for handling conflicting files; higher values win.
    pub priority: Option<u32>,
}

/// Split a dotted path into a globbed form, treating `null` and `*`
/// segments as globs.
fn split_attr_path_glob(path: &str) -> AttrPathGlob {
    split_attr_path(path)
        .into_iter()
        .map(|part| {
            if part == "null" || part == "*" {
                None
            } else {
                Some(part)
            }
        })
        .collect()
}

fn glob_from_abs_path(abs_path: &DescriptorAbsPath) -> AttrPathGlob {
    match abs_path {
        DescriptorAbsPath::Parts(parts) => parts.clone(),
        DescriptorAbsPath::Dotted(path) => split_attr_path_glob(path),
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::msg(ErrorKind::InvalidManifestDescriptor, msg.into())
}

/// Whether any component contains a glob without being entirely one,
/// e.g. `b*ar`.
fn glob_in_attr_name(attrs: &AttrPathGlob) -> bool {
    attrs
        .iter()
        .any(|attr| attr.as_ref().is_some_and(|attr| attr.contains('*')))
}

/// Validate a single attribute suitable for the `name` field.
fn validated_single_attr(attrs: &AttrPathGlob) -> Result<String> {
    match &attrs[0] {
        Some(attr) if !attr.contains('*') => Ok(attr.clone()),
        _ => Err(invalid(format!(
            "globs are only allowed to replace entire system names: '{}'",
            display_globbed_path(attrs)
        ))),
    }
}

/// Validate a relative path. Relative paths don't contain a system
/// element, so no globs are allowed at all.
fn validated_relative_path(attrs: &AttrPathGlob, strings: Vec<String>) -> Result<AttrPath> {
    if attrs.contains(&None) || glob_in_attr_name(attrs) {
        Err(invalid(format!(
            "globs are only allowed to replace entire system names: '{}'",
            display_globbed_path(attrs)
        )))
    } else if attrs.len() < 2 {
        Err(invalid("relative paths must contain at least 2 attributes"))
    } else {
        Ok(strings)
    }
}

/// Validate an absolute path: at most one glob, and only in the
/// system position.
fn validated_absolute_path(attrs: &AttrPathGlob) -> Result<AttrPathGlob> {
    let globs = attrs.iter().filter(|attr| attr.is_none()).count();
    let system_globbed = attrs[1].is_none();
    if globs > 1 || glob_in_attr_name(attrs) || (globs == 1 && !system_globbed) {
        return Err(invalid(format!(
            "globs are only allowed to replace entire system names: '{}'",
            display_globbed_path(attrs)
        )));
    }
    Ok(attrs.clone())
}

/// Whether the path has enough components and begins with a recognized
/// subtree prefix.
fn is_absolute_path(attrs: &AttrPathGlob) -> bool {
    if attrs.len() < 3 {
        return false;
    }
    matches!(
        attrs[0].as_deref(),
        Some("legacyPackages") | Some("packages")
    )
}

impl ManifestDescriptorRaw {
    /// Parse from the JSON table form. Unknown fields are rejected.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::msg(
                ErrorKind::ParseDescriptor,
                format!(
                    "descriptor must be an object or string, but is a {}",
                    json_type_name(value)
                ),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|err| {
            Error::caught(ErrorKind::ParseDescriptor, "couldn't interpret descriptor", err)
        })
    }

    /// Ensure the raw fields are consistent: `abspath` must be valid and
    /// agree with `path` and `systems` when those are set.
    pub fn check(&self, iid: &str) -> Result<()> {
        let Some(abs_path) = &self.abspath else {
            return Ok(());
        };
        let glob = glob_from_abs_path(abs_path);
        if glob.len() < 3 {
            return Err(invalid(format!(
                "'install.{iid}.abspath' must have at least three parts"
            )));
        }
        match glob[0].as_deref() {
            Some("legacyPackages") | Some("packages") => {}
            _ => {
                return Err(invalid(format!(
                    "'install.{iid}.abspath' must have a subtree as its first element"
                )));
            }
        }
        if self.path.is_some() {
            return Err(invalid(format!(
                "'install.{iid}.path' conflicts with 'install.{iid}.abspath'"
            )));
        }
        if let (Some(systems), Some(system)) = (&self.systems, &glob[1]) {
            if !systems.contains(system) {
                return Err(invalid(format!(
                    "'install.{iid}.systems' conflicts with the 'abspath' system element"
                )));
            }
        }
        Ok(())
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Find the first occurrence of `needle` not preceded by a `\` escape.
fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let mut was_escaped = false;
    for (idx, chr) in s.char_indices() {
        if was_escaped {
            was_escaped = false;
        } else if chr == '\\' {
            was_escaped = true;
        } else if chr == needle {
            return Some(idx);
        }
    }
    None
}

impl FromStr for ManifestDescriptorRaw {
    type Err = Error;

    fn from_str(descriptor: &str) -> Result<Self> {
        let mut raw = ManifestDescriptorRaw::default();

        // Grab the input if one was given.
        let mut rest = descriptor;
        if let Some(idx) = find_unescaped(descriptor, INPUT_SIGIL) {
            raw.package_repository = Some(SourceRef::Url(descriptor[..idx].to_string()));
            rest = &descriptor[idx + 1..];
        }

        // Grab the attribute path or package name.
        let (attrs_str, version) = match rest.split_once(VERSION_SIGIL) {
            Some((attrs_str, version)) => (attrs_str, Some(version)),
            None => (rest, None),
        };
        if attrs_str.is_empty() {
            return Err(invalid("descriptor was missing a package name"));
        }

        let glob = split_attr_path_glob(attrs_str);
        let strings = split_attr_path(attrs_str);
        if glob
            .iter()
            .any(|attr| attr.as_ref().is_some_and(String::is_empty))
        {
            return Err(invalid(format!(
                "descriptor attribute name was malformed: '{attrs_str}'"
            )));
        }

        match glob.len() {
            1 => {
                // Match against `name`, `pname`, or `attrName`.
                raw.name = Some(validated_single_attr(&glob)?);
            }
            2 => {
                // Definitely a relative path.
                raw.path = Some(DescriptorPath::Parts(validated_relative_path(
                    &glob, strings,
                )?));
            }
            _ => {
                // Relative or absolute depending on the prefix.
                if is_absolute_path(&glob) {
                    raw.abspath = Some(DescriptorAbsPath::Parts(validated_absolute_path(&glob)?));
                } else {
                    raw.path = Some(DescriptorPath::Parts(validated_relative_path(
                        &glob, strings,
                    )?));
                }
            }
        }

        if let Some(version) = version {
            raw.version = Some(version.to_string());
        }

        Ok(raw)
    }
}

/// The canonical descriptor consumed by the resolver.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ManifestDescriptor {
    /// Match `name`, `pname`, or `attrName`.
    pub name: Option<String>,
    /// Whether resolution is allowed to fail without producing errors.
    pub optional: bool,
    /// Named group the package is a member of.
    pub group: Option<GroupName>,
    /// Match an exact version.
    pub version: Option<String>,
    /// Match a semantic version range.
    pub semver: Option<String>,
    /// Match a subtree.
    pub subtree: Option<Subtree>,
    /// Only resolve for the given systems.
    pub systems: Option<Vec<System>>,
    /// Match a relative attribute path.
    pub path: Option<AttrPath>,
    /// Force resolution in the given input.
    pub input: Option<SourceRef>,
    /// Rank for handling conflicting files; higher values win.
    pub priority: u32,
}

impl Default for ManifestDescriptor {
    fn default() -> Self {
        ManifestDescriptor {
            name: None,
            optional: false,
            group: None,
            version: None,
            semver: None,
            subtree: None,
            systems: None,
            path: None,
            input: None,
            priority: DEFAULT_PRIORITY,
        }
    }
}

/// Distinguish ranges from exact version matchers.
///
/// `4.2.0` is not a range, but `4.2` is; an explicit exact match on
/// `4.2` is written `=4.2`.
fn version_or_semver(descriptor: &mut ManifestDescriptor, version: &str) {
    let trimmed = trim_copy(version);

    // Empty is recognized as the _any_ range.
    if trimmed.is_empty() {
        descriptor.semver = Some(trimmed);
        return;
    }

    match trimmed.chars().next().unwrap() {
        EXACT_VERSION_SIGIL => descriptor.version = Some(trimmed[1..].to_string()),
        '*' | '~' | '^' | '>' | '<' => descriptor.semver = Some(trimmed),
        _ => {
            // A valid semver or a date is an exact match, not a range.
            if versions::is_semver(&trimmed)
                || versions::is_date(&trimmed)
                || !versions::is_semver_range(&trimmed)
            {
                descriptor.version = Some(trimmed);
            } else {
                descriptor.semver = Some(trimmed);
            }
        }
    }
}

impl TryFrom<&ManifestDescriptorRaw> for ManifestDescriptor {
    type Error = Error;

    fn try_from(raw: &ManifestDescriptorRaw) -> Result<Self> {
        let mut descriptor = ManifestDescriptor {
            name: raw.name.clone(),
            optional: raw.optional.unwrap_or(false),
            group: raw.package_group.clone(),
            ..ManifestDescriptor::default()
        };

        if let Some(version) = &raw.version {
            version_or_semver(&mut descriptor, version);
        }

        // `abspath` has to be split before most other fields.
        if let Some(abs_path) = &raw.abspath {
            let glob = glob_from_abs_path(abs_path);
            if glob.len() < 3 {
                return Err(invalid("'abspath' must have at least three parts"));
            }
            let subtree = glob[0]
                .as_deref()
                .ok_or_else(|| invalid("'abspath' may only have a glob as its second element"))?;
            descriptor.subtree = Some(subtree.parse().map_err(|_| {
                invalid(format!("'abspath' has unrecognized subtree '{subtree}'"))
            })?);

            let mut path = AttrPath::new();
            for attr in &glob[2..] {
                match attr {
                    Some(attr) => path.push(attr.clone()),
                    None => {
                        return Err(invalid(
                            "'abspath' may only have a glob as its second element",
                        ));
                    }
                }
            }
            descriptor.path = Some(path);

            if let Some(system) = &glob[1] {
                let systems = vec![system.clone()];
                if let Some(raw_systems) = &raw.systems {
                    if raw_systems != &systems {
                        return Err(invalid(
                            "'systems' list conflicts with 'abspath' system specification",
                        ));
                    }
                }
                descriptor.systems = Some(systems);
            }
        }

        // Only set if it wasn't derived from `abspath`.
        if descriptor.systems.is_none() {
            descriptor.systems = raw.systems.clone();
        }

        if let Some(rel_path) = &raw.path {
            let path = match rel_path {
                DescriptorPath::Parts(parts) => parts.clone(),
                DescriptorPath::Dotted(dotted) => split_attr_path(dotted),
            };
            match &descriptor.path {
                Some(existing) if existing != &path => {
                    return Err(invalid("'path' conflicts with 'abspath'"));
                }
                Some(_) => {}
                None => descriptor.path = Some(path),
            }
        }

        descriptor.input = raw.package_repository.clone();

        if let Some(priority) = raw.priority {
            descriptor.priority = priority;
        }

        Ok(descriptor)
    }
}

impl FromStr for ManifestDescriptor {
    type Err = Error;

    fn from_str(descriptor: &str) -> Result<Self> {
        ManifestDescriptor::try_from(&descriptor.parse::<ManifestDescriptorRaw>()?)
    }
}

impl ManifestDescriptor {
    /// Construct from a raw descriptor, falling back to the install id
    /// as the name when the descriptor provides no matcher of its own.
    pub fn from_raw(iid: &str, raw: &ManifestDescriptorRaw) -> Result<Self> {
        let mut descriptor = ManifestDescriptor::try_from(raw)?;
        if descriptor.name.is_none() && descriptor.path.is_none() {
            descriptor.name = Some(iid.to_string());
        }
        Ok(descriptor)
    }

    /// A descriptor must have something to match on.
    pub fn check(&self) -> Result<()> {
        if self.name.is_none() && self.path.is_none() {
            return Err(invalid("descriptor must set at least one of 'name' or 'path'"));
        }
        Ok(())
    }

    /// Fill a set of query args with this descriptor's requirements.
    ///
    /// Does NOT clear `args` first; this is intended to refine a base
    /// query built from the environment's options.
    pub fn fill_query_args(&self, args: &mut PkgQueryArgs) {
        // Must exactly match either `pname` or `attrName`.
        if let Some(name) = &self.name {
            args.pname_or_attr_name = Some(name.clone());
        }

        if let Some(version) = &self.version {
            args.version = Some(version.clone());
        } else if let Some(semver) = &self.semver {
            args.semver = Some(semver.clone());
            // `~<VERSION>-<TAG>` ranges ask for pre-releases.
            if semver.starts_with('~') {
                args.prefer_pre_releases = semver
                    .split_whitespace()
                    .next()
                    .is_some_and(|token| token.contains('-'));
            }
        }

        if let Some(subtree) = self.subtree {
            args.subtrees = Some(vec![subtree]);
        }

        if let Some(systems) = &self.systems {
            args.systems = systems.clone();
        }

        args.rel_path = self.path.clone();
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_name_with_range() {
        let descriptor: ManifestDescriptor = "hello@^1.2".parse().unwrap();
        assert_eq!(descriptor.name.as_deref(), Some("hello"));
        assert_eq!(descriptor.semver.as_deref(), Some("^1.2"));
        assert_eq!(descriptor.version, None);
    }

    #[test]
    fn parses_input_and_path() {
        let descriptor: ManifestDescriptor = "nixpkgs:foo.bar@^1.2".parse().unwrap();
        assert_eq!(
            descriptor.input,
            Some(SourceRef::Url("nixpkgs".to_string()))
        );
        assert_eq!(
            descriptor.path,
            Some(vec!["foo".to_string(), "bar".to_string()])
        );
        assert_eq!(descriptor.semver.as_deref(), Some("^1.2"));
    }

    #[test]
    fn exact_version_sigil_forces_exact_match() {
        let descriptor: ManifestDescriptor = "foo@=1.2".parse().unwrap();
        assert_eq!(descriptor.name.as_deref(), Some("foo"));
        assert_eq!(descriptor.version.as_deref(), Some("1.2"));
        assert_eq!(descriptor.semver, None);
    }

    #[test]
    fn version_classification() {
        // A full semver is an exact match.
        let descriptor: ManifestDescriptor = "foo@2.12.1".parse().unwrap();
        assert_eq!(descriptor.version.as_deref(), Some("2.12.1"));

        // A date is an exact match.
        let descriptor: ManifestDescriptor = "foo@2023-05-31".parse().unwrap();
        assert_eq!(descriptor.version.as_deref(), Some("2023-05-31"));

        // A partial version is a range.
        let descriptor: ManifestDescriptor = "foo@23.11".parse().unwrap();
        assert_eq!(descriptor.semver.as_deref(), Some("23.11"));

        // Empty version text means any version.
        let descriptor: ManifestDescriptor = "foo@".parse().unwrap();
        assert_eq!(descriptor.semver.as_deref(), Some(""));

        // Anything unrecognizable is an exact match.
        let descriptor: ManifestDescriptor = "foo@some-tag".parse().unwrap();
        assert_eq!(descriptor.version.as_deref(), Some("some-tag"));
    }

    #[test]
    fn parses_absolute_globbed_path() {
        let descriptor: ManifestDescriptor = "legacyPackages.*.hello".parse().unwrap();
        assert_eq!(descriptor.subtree, Some(Subtree::LegacyPackages));
        assert_eq!(descriptor.path, Some(vec!["hello".to_string()]));
        assert_eq!(descriptor.systems, None);
        assert_eq!(descriptor.name, None);
    }

    #[test]
    fn absolute_path_with_system_sets_systems() {
        let descriptor: ManifestDescriptor =
            "legacyPackages.x86_64-linux.hello".parse().unwrap();
        assert_eq!(descriptor.systems, Some(vec!["x86_64-linux".to_string()]));
        assert_eq!(descriptor.path, Some(vec!["hello".to_string()]));
    }

    #[test]
    fn deep_paths_without_subtree_prefix_are_relative() {
        let descriptor: ManifestDescriptor = "python310Packages.pip.extras".parse().unwrap();
        assert_eq!(descriptor.subtree, None);
        assert_eq!(
            descriptor.path,
            Some(vec![
                "python310Packages".to_string(),
                "pip".to_string(),
                "extras".to_string()
            ])
        );
    }

    #[test]
    fn quoted_attrs_keep_their_dots() {
        let descriptor: ManifestDescriptor =
            "nixpkgs:rubyPackages.\"http_parser.rb\"".parse().unwrap();
        assert_eq!(
            descriptor.path,
            Some(vec![
                "rubyPackages".to_string(),
                "http_parser.rb".to_string()
            ])
        );
    }

    #[test]
    fn rejects_stray_globs() {
        assert!("*.hello".parse::<ManifestDescriptor>().is_err());
        assert!("foo.b*ar.baz".parse::<ManifestDescriptor>().is_err());
        assert!("legacyPackages.*.*".parse::<ManifestDescriptor>().is_err());
        assert!("packages.x86_64-linux.*".parse::<ManifestDescriptor>().is_err());
    }

    #[test]
    fn rejects_empty_names_and_attrs() {
        assert!("nixpkgs:".parse::<ManifestDescriptor>().is_err());
        assert!("nixpkgs:foo..bar".parse::<ManifestDescriptor>().is_err());
    }

    #[test]
    fn rejects_unknown_table_fields() {
        let err = ManifestDescriptorRaw::from_value(&serde_json::json!({
            "name": "hello",
            "unexpected": true,
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseDescriptor);
    }

    #[test]
    fn raw_check_rejects_inconsistent_fields() {
        let raw = ManifestDescriptorRaw {
            abspath: Some(DescriptorAbsPath::Dotted(
                "legacyPackages.x86_64-linux.hello".to_string(),
            )),
            systems: Some(vec!["aarch64-linux".to_string()]),
            ..ManifestDescriptorRaw::default()
        };
        assert!(raw.check("hello").is_err());

        let raw = ManifestDescriptorRaw {
            abspath: Some(DescriptorAbsPath::Dotted(
                "legacyPackages.x86_64-linux.hello".to_string(),
            )),
            path: Some(DescriptorPath::Dotted("hello".to_string())),
            ..ManifestDescriptorRaw::default()
        };
        assert!(raw.check("hello").is_err());
    }

    #[test]
    fn fills_query_args() {
        let descriptor: ManifestDescriptor = "nixpkgs:legacyPackages.*.hello@^2.12"
            .parse()
            .unwrap();
        let mut args = PkgQueryArgs::default();
        descriptor.fill_query_args(&mut args);
        assert_eq!(args.semver.as_deref(), Some("^2.12"));
        assert_eq!(args.subtrees, Some(vec![Subtree::LegacyPackages]));
        assert_eq!(args.rel_path, Some(vec!["hello".to_string()]));
        assert_eq!(args.pname_or_attr_name, None);
    }

    #[test]
    fn tilde_prerelease_ranges_prefer_pre_releases() {
        let descriptor: ManifestDescriptor = "hello@~2.12.0-pre".parse().unwrap();
        let mut args = PkgQueryArgs::default();
        descriptor.fill_query_args(&mut args);
        assert!(args.prefer_pre_releases);

        let descriptor: ManifestDescriptor = "hello@~2.12.0".parse().unwrap();
        let mut args = PkgQueryArgs::default();
        descriptor.fill_query_args(&mut args);
        assert!(!args.prefer_pre_releases);
    }

    #[test]
    fn empty_descriptor_uses_install_id() {
        let descriptor =
            ManifestDescriptor::from_raw("ripgrep", &ManifestDescriptorRaw::default()).unwrap();
        assert_eq!(descriptor.name.as_deref(), Some("ripgrep"));
        assert_eq!(descriptor.priority, DEFAULT_PRIORITY);
        assert!(!descriptor.optional);
    }
}
