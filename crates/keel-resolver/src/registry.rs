//! Named inputs with priority ordering.
//!
//! A registry maps input names to source references and defines the
//! order in which inputs are tried during resolution.

use std::collections::BTreeMap;

use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::Subtree;
use keel_core::util::merge_vectors;
use keel_pkgdb::ref_fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::lockfile::LockedInput;

pub type InputName = String;

/// A source reference: either a URL string or its exploded attribute
/// form. The attribute form is tried first when deserializing; strings
/// are the most permissive alternative and come last.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SourceRef {
    Attrs(BTreeMap<String, Value>),
    Url(String),
}

fn string_attr(attrs: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    attrs.get(key).and_then(Value::as_str).map(str::to_string)
}

fn is_rev(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|chr| chr.is_ascii_hexdigit())
}

impl SourceRef {
    /// The reference's scheme type, e.g. `github`.
    pub fn scheme_type(&self) -> Option<String> {
        match self {
            SourceRef::Attrs(attrs) => string_attr(attrs, "type"),
            SourceRef::Url(url) => match url.split_once(':') {
                Some((scheme, _)) => Some(scheme.split('+').next().unwrap_or(scheme).to_string()),
                // A bare name is an indirect reference into some other
                // registry.
                None => Some("indirect".to_string()),
            },
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.scheme_type().as_deref(), Some("indirect") | Some("flake"))
    }

    /// The exploded attribute form of this reference.
    pub fn attrs(&self) -> Result<BTreeMap<String, Value>> {
        match self {
            SourceRef::Attrs(attrs) => Ok(attrs.clone()),
            SourceRef::Url(url) => parse_url(url),
        }
    }

    /// The canonical URL string form of this reference.
    pub fn url_string(&self) -> Result<String> {
        match self {
            SourceRef::Attrs(attrs) => render_url(attrs),
            // Canonicalize by round-tripping through the attribute form,
            // so that equivalent spellings produce equal fingerprints.
            SourceRef::Url(url) => render_url(&parse_url(url)?),
        }
    }

    /// Pin this reference, producing the locked form used in lockfiles
    /// and to derive index file names.
    ///
    /// References must already be locally available; no fetching happens
    /// here.
    pub fn lock(&self) -> Result<LockedInput> {
        let attrs = self.attrs()?;
        let url = render_url(&attrs)?;
        Ok(LockedInput {
            fingerprint: ref_fingerprint(&url),
            url,
            attrs: Value::Object(attrs.into_iter().collect()),
        })
    }
}

/// Parse a URL string into its attribute form.
fn parse_url(url: &str) -> Result<BTreeMap<String, Value>> {
    let bad = |msg: String| Error::msg(ErrorKind::InvalidRegistry, msg);

    let Some((scheme, rest)) = url.split_once(':') else {
        // Bare names are indirect references.
        let mut attrs = BTreeMap::new();
        attrs.insert("type".to_string(), Value::String("indirect".to_string()));
        attrs.insert("id".to_string(), Value::String(url.to_string()));
        return Ok(attrs);
    };

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let mut attrs: BTreeMap<String, Value> = BTreeMap::new();
    match scheme {
        "github" => {
            attrs.insert("type".to_string(), Value::String("github".to_string()));
            let parts: Vec<&str> = path.split('/').collect();
            match parts.as_slice() {
                [owner, repo] => {
                    attrs.insert("owner".to_string(), Value::String(owner.to_string()));
                    attrs.insert("repo".to_string(), Value::String(repo.to_string()));
                }
                [owner, repo, rev_or_ref] => {
                    attrs.insert("owner".to_string(), Value::String(owner.to_string()));
                    attrs.insert("repo".to_string(), Value::String(repo.to_string()));
                    let key = if is_rev(rev_or_ref) { "rev" } else { "ref" };
                    attrs.insert(key.to_string(), Value::String(rev_or_ref.to_string()));
                }
                _ => return Err(bad(format!("invalid github reference '{url}'"))),
            }
        }
        "wrapped" => {
            attrs.insert("type".to_string(), Value::String("wrapped".to_string()));
            let key = if is_rev(path) { "rev" } else { "ref" };
            attrs.insert(key.to_string(), Value::String(path.to_string()));
        }
        "path" => {
            attrs.insert("type".to_string(), Value::String("path".to_string()));
            attrs.insert("path".to_string(), Value::String(path.to_string()));
        }
        "flake" => {
            attrs.insert("type".to_string(), Value::String("indirect".to_string()));
            attrs.insert("id".to_string(), Value::String(path.to_string()));
        }
        "http" | "https" | "git" | "git+http" | "git+https" | "tarball" | "file" => {
            attrs.insert("type".to_string(), Value::String("git".to_string()));
            attrs.insert("url".to_string(), Value::String(url.to_string()));
        }
        other => return Err(bad(format!("unsupported reference scheme '{other}'"))),
    }

    if let Some(query) = query {
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad(format!("invalid query parameter '{pair}' in '{url}'")))?;
            attrs.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    Ok(attrs)
}

/// Render an attribute form back into its canonical URL string.
fn render_url(attrs: &BTreeMap<String, Value>) -> Result<String> {
    let bad = |msg: String| Error::msg(ErrorKind::InvalidRegistry, msg);
    let scheme_type = string_attr(attrs, "type")
        .ok_or_else(|| bad("reference is missing a 'type' attribute".to_string()))?;

    match scheme_type.as_str() {
        "github" => {
            let owner = string_attr(attrs, "owner")
                .ok_or_else(|| bad("github reference is missing 'owner'".to_string()))?;
            let repo = string_attr(attrs, "repo")
                .ok_or_else(|| bad("github reference is missing 'repo'".to_string()))?;
            if let Some(rev) = string_attr(attrs, "rev") {
                Ok(format!("github:{owner}/{repo}/{rev}"))
            } else if let Some(reference) = string_attr(attrs, "ref") {
                Ok(format!("github:{owner}/{repo}/{reference}"))
            } else {
                Ok(format!("github:{owner}/{repo}"))
            }
        }
        "wrapped" => {
            let pin = string_attr(attrs, "rev")
                .or_else(|| string_attr(attrs, "ref"))
                .ok_or_else(|| bad("wrapped reference is missing 'rev' or 'ref'".to_string()))?;
            Ok(format!("wrapped:{pin}"))
        }
        "path" => {
            let path = string_attr(attrs, "path")
                .ok_or_else(|| bad("path reference is missing 'path'".to_string()))?;
            Ok(format!("path:{path}"))
        }
        "indirect" => {
            let id = string_attr(attrs, "id")
                .ok_or_else(|| bad("indirect reference is missing 'id'".to_string()))?;
            Ok(format!("flake:{id}"))
        }
        "git" | "tarball" => {
            let mut url = string_attr(attrs, "url")
                .ok_or_else(|| bad(format!("{scheme_type} reference is missing 'url'")))?;
            let mut params = Vec::new();
            if !url.contains("rev=") {
                if let Some(rev) = string_attr(attrs, "rev") {
                    params.push(format!("rev={rev}"));
                }
            }
            if !url.contains("ref=") {
                if let Some(reference) = string_attr(attrs, "ref") {
                    params.push(format!("ref={reference}"));
                }
            }
            if !params.is_empty() {
                url.push(if url.contains('?') { '&' } else { '?' });
                url.push_str(&params.join("&"));
            }
            Ok(url)
        }
        other => Err(bad(format!("unsupported reference type '{other}'"))),
    }
}

/// Preferences associated with a named registry input.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryInput {
    /// The source reference packages are drawn from.
    pub from: SourceRef,
    /// Subtrees to search, in priority order.
    pub subtrees: Option<Vec<Subtree>>,
}

impl RegistryInput {
    pub fn new(from: SourceRef) -> Self {
        RegistryInput {
            from,
            subtrees: None,
        }
    }
}

/// A set of named inputs with priority ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistryRaw {
    /// Source references associated with named inputs.
    #[serde(default)]
    pub inputs: BTreeMap<InputName, RegistryInput>,
    /// Priority order used to process inputs. Inputs which do not appear
    /// here are handled in lexicographical order afterwards.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority: Vec<InputName>,
}

impl RegistryRaw {
    /// Input names in resolution order: the explicit priority list first,
    /// then the remaining inputs lexicographically.
    pub fn order(&self) -> Vec<InputName> {
        let mut order: Vec<InputName> = self
            .priority
            .iter()
            .filter(|name| self.inputs.contains_key(*name))
            .cloned()
            .collect();
        for name in self.inputs.keys() {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    /// Merge with another registry, overriding any existing values with
    /// those from `overrides`. Priority lists merge by appending
    /// unique entries.
    pub fn merge(&mut self, overrides: &RegistryRaw) {
        for (name, input) in &overrides.inputs {
            self.inputs.insert(name.clone(), input.clone());
        }
        self.priority = merge_vectors(&self.priority, &overrides.priority);
    }

    /// Reject indirect references; resolution requires locally
    /// available snapshots.
    pub fn check(&self) -> Result<()> {
        for (name, input) in &self.inputs {
            if input.from.is_indirect() {
                return Err(Error::msg(
                    ErrorKind::InvalidRegistry,
                    format!("registry input '{name}' may not be indirect"),
                ));
            }
        }
        Ok(())
    }
}
