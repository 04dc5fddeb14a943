//! Loading of legacy lockfile versions into the canonical form.
//!
//! Version 0 is the canonical shape and loads directly. Version 1 stores
//! packages as a flat list with pre-resolved locations; the adapter
//! rebuilds the canonical per-system map, prepending the legacy subtree
//! and system to catalog attribute paths and wrapping their inputs into
//! the synthetic `wrapped` scheme pinned to the commit revision alone.

use keel_core::error::{Error, ErrorKind, Result};
use keel_core::util::split_attr_path;
use keel_pkgdb::ref_fingerprint;
use serde_json::Value;
use url::Url;

use crate::lockfile::{LockedInput, LockedPackage, LockfileRaw, PackageInfo};
use crate::manifest_raw::ManifestRaw;

/// The only host https package URLs may point at.
const ALLOWED_HTTPS_HOST: &str = "github.com";

fn invalid(msg: impl Into<String>) -> Error {
    Error::msg(ErrorKind::InvalidLockfile, msg.into())
}

/// Translate an allow-listed https URL into the structured `github`
/// form, preserving `ref` and `rev` when present.
///
/// URLs outside the allowlist, or carrying attributes beyond
/// `url`/`ref`/`rev`, are rejected.
pub(crate) fn https_url_to_github_input(locked_url: &str) -> Result<LockedInput> {
    let parsed = Url::parse(locked_url)
        .map_err(|err| Error::caught(ErrorKind::InvalidLockfile, "invalid package URL", err))?;
    if parsed.scheme() != "https" || parsed.host_str() != Some(ALLOWED_HTTPS_HOST) {
        return Err(invalid(format!(
            "unsupported package URL '{locked_url}'; must begin with https://{ALLOWED_HTTPS_HOST}"
        )));
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default();
    let [owner, repo] = segments.as_slice() else {
        return Err(invalid(format!(
            "unsupported package URL '{locked_url}'; expected https://{ALLOWED_HTTPS_HOST}/<owner>/<repo>"
        )));
    };

    let mut attrs = serde_json::Map::new();
    attrs.insert("type".to_string(), Value::String("github".to_string()));
    attrs.insert("owner".to_string(), Value::String(owner.to_string()));
    attrs.insert("repo".to_string(), Value::String(repo.to_string()));

    let mut pin = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "rev" | "ref" => {
                if key == "rev" || pin.is_none() {
                    pin = Some(value.to_string());
                }
                attrs.insert(key.to_string(), Value::String(value.to_string()));
            }
            other => {
                return Err(invalid(format!(
                    "unsupported package URL '{locked_url}': contains attribute '{other}' \
                     beyond 'url', 'ref', and 'rev'"
                )));
            }
        }
    }

    let url = match &pin {
        Some(pin) => format!("github:{owner}/{repo}/{pin}"),
        None => format!("github:{owner}/{repo}"),
    };
    Ok(LockedInput {
        fingerprint: ref_fingerprint(&url),
        url,
        attrs: Value::Object(attrs),
    })
}

/// Wrap a `github` input into the synthetic `wrapped` scheme whose URL
/// carries only the commit revision.
pub(crate) fn wrap_github_input(input: &LockedInput) -> Result<LockedInput> {
    let pin = input
        .attrs
        .get("rev")
        .or_else(|| input.attrs.get("ref"))
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("package input is missing a 'rev' or 'ref' to wrap"))?;
    let url = format!("wrapped:{pin}");
    let mut attrs = serde_json::Map::new();
    attrs.insert("type".to_string(), Value::String("wrapped".to_string()));
    let key = if input.attrs.get("rev").is_some() {
        "rev"
    } else {
        "ref"
    };
    attrs.insert(key.to_string(), Value::String(pin.to_string()));
    Ok(LockedInput {
        fingerprint: ref_fingerprint(&url),
        url,
        attrs: Value::Object(attrs),
    })
}

fn str_field(package: &Value, key: &str, idx: usize) -> Result<String> {
    package
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("couldn't parse lockfile field 'packages[{idx}].{key}'")))
}

fn info_from_v1(package: &Value, fallback_pname: &str) -> PackageInfo {
    let text = |key: &str| {
        package
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    PackageInfo {
        pname: text("pname").unwrap_or_else(|| fallback_pname.to_string()),
        version: text("version"),
        description: text("description"),
        license: text("license"),
        broken: package.get("broken").and_then(Value::as_bool),
        unfree: package.get("unfree").and_then(Value::as_bool),
    }
}

/// Convert one v1 package entry into the canonical locked package.
fn package_from_v1(package: &Value, system: &str, idx: usize) -> Result<LockedPackage> {
    let priority = package
        .get("priority")
        .and_then(Value::as_u64)
        .unwrap_or(crate::descriptor::DEFAULT_PRIORITY as u64) as u32;

    // Packages resolved against an arbitrary snapshot carry their full
    // locked attribute path; catalog packages only carry the path below
    // the system level.
    if let Some(locked_attr_path) = package
        .get("locked-flake-attr-path")
        .and_then(Value::as_str)
    {
        let locked_url = str_field(package, "locked_url", idx)?;
        let attr_path = split_attr_path(locked_attr_path);
        let reference = crate::registry::SourceRef::Url(locked_url);
        let input = reference
            .lock()
            .map_err(|err| err.prefix_context(format!("couldn't parse 'packages[{idx}]'")))?;
        let pname = attr_path.last().cloned().unwrap_or_default();
        Ok(LockedPackage {
            input,
            attr_path,
            priority,
            info: info_from_v1(package, &pname),
        })
    } else {
        let rel_path = str_field(package, "attr_path", idx)?;
        let locked_url = str_field(package, "locked_url", idx)?;
        let mut attr_path = vec!["legacyPackages".to_string(), system.to_string()];
        attr_path.extend(split_attr_path(&rel_path));

        let github = https_url_to_github_input(&locked_url)
            .map_err(|err| err.prefix_context(format!("couldn't parse 'packages[{idx}]'")))?;
        let input = wrap_github_input(&github)?;
        let pname = attr_path.last().cloned().unwrap_or_default();
        Ok(LockedPackage {
            input,
            attr_path,
            priority,
            info: info_from_v1(package, &pname),
        })
    }
}

/// Load a v1 lockfile into the canonical raw form.
///
/// The carried manifest keeps the fields the environment builder
/// consumes; v1 records no registry.
pub(crate) fn lockfile_raw_from_v1(value: &Value) -> Result<LockfileRaw> {
    let version = value.get("lockfile-version").and_then(Value::as_u64);
    if version != Some(1) {
        return Err(invalid(format!(
            "trying to parse v{} lockfile as v1",
            version.map_or("?".to_string(), |version| version.to_string())
        )));
    }

    let mut manifest = serde_json::Map::new();
    if let Some(source) = value.get("manifest").and_then(Value::as_object) {
        for key in ["vars", "hook", "profile", "options", "build"] {
            if let Some(section) = source.get(key) {
                if !section.is_null() {
                    manifest.insert(key.to_string(), section.clone());
                }
            }
        }
    }
    let manifest = ManifestRaw::from_value(&Value::Object(manifest))
        .map_err(|err| err.prefix_context("couldn't parse lockfile manifest"))?;

    let mut raw = LockfileRaw {
        manifest,
        ..LockfileRaw::default()
    };

    let empty = Vec::new();
    let packages = match value.get("packages") {
        None | Some(Value::Null) => &empty,
        Some(Value::Array(packages)) => packages,
        Some(_) => return Err(invalid("lockfile 'packages' field must be a list")),
    };
    for (idx, package) in packages.iter().enumerate() {
        let install_id = str_field(package, "install_id", idx)?;
        let system = str_field(package, "system", idx)?;
        let locked = package_from_v1(package, &system, idx)?;
        raw.packages
            .entry(system)
            .or_default()
            .insert(install_id, Some(locked));
    }

    Ok(raw)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lockfile::Lockfile;

    const REV: &str = "cccccccccccccccccccccccccccccccccccccccc";

    #[test]
    fn translates_allowlisted_https_urls() {
        let input =
            https_url_to_github_input(&format!("https://github.com/example/snapshot?rev={REV}"))
                .unwrap();
        assert_eq!(input.url, format!("github:example/snapshot/{REV}"));
        assert_eq!(
            input.attrs.get("owner").and_then(Value::as_str),
            Some("example")
        );
        assert_eq!(input.attrs.get("rev").and_then(Value::as_str), Some(REV));
    }

    #[test]
    fn rejects_other_hosts_and_extra_attributes() {
        let err =
            https_url_to_github_input("https://example.com/example/snapshot").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLockfile);

        let err = https_url_to_github_input(
            "https://github.com/example/snapshot?rev=abc&dir=subdir",
        )
        .unwrap_err();
        assert!(err.to_string().contains("dir"));
    }

    #[test]
    fn wraps_github_inputs_to_the_revision_alone() {
        let github =
            https_url_to_github_input(&format!("https://github.com/example/snapshot?rev={REV}"))
                .unwrap();
        let wrapped = wrap_github_input(&github).unwrap();
        assert_eq!(wrapped.url, format!("wrapped:{REV}"));
        assert_eq!(
            wrapped.attrs.get("type").and_then(Value::as_str),
            Some("wrapped")
        );
        assert_eq!(wrapped.attrs.get("rev").and_then(Value::as_str), Some(REV));
        assert_eq!(wrapped.attrs.get("owner"), None);
    }

    fn v1_value() -> Value {
        serde_json::json!({
            "lockfile-version": 1,
            "manifest": {
                "vars": { "GREETING": "hi" },
                "hook": { "on-activate": "true" },
                "options": { "systems": ["x86_64-linux"] },
            },
            "packages": [
                {
                    "install_id": "hello",
                    "system": "x86_64-linux",
                    "attr_path": "hello",
                    "locked_url": format!("https://github.com/example/snapshot?rev={REV}"),
                    "priority": 5,
                    "pname": "hello",
                    "version": "2.12.1",
                },
                {
                    "install_id": "greeter",
                    "system": "x86_64-linux",
                    "locked-flake-attr-path": "packages.x86_64-linux.greeter",
                    "locked_url": format!("github:example/greeter/{REV}"),
                    "priority": 3,
                },
            ],
        })
    }

    #[test]
    fn loads_v1_lockfiles_into_the_canonical_form() {
        let lockfile = Lockfile::from_value(&v1_value()).unwrap();
        let packages = &lockfile.raw().packages["x86_64-linux"];

        let hello = packages["hello"].as_ref().unwrap();
        assert_eq!(
            hello.attr_path,
            vec!["legacyPackages", "x86_64-linux", "hello"]
        );
        assert_eq!(hello.input.url, format!("wrapped:{REV}"));
        assert_eq!(hello.info.pname, "hello");
        assert_eq!(hello.info.version.as_deref(), Some("2.12.1"));

        let greeter = packages["greeter"].as_ref().unwrap();
        assert_eq!(
            greeter.attr_path,
            vec!["packages", "x86_64-linux", "greeter"]
        );
        assert_eq!(greeter.input.url, format!("github:example/greeter/{REV}"));
        assert_eq!(greeter.priority, 3);

        assert_eq!(
            lockfile.raw().manifest.vars.as_ref().unwrap()["GREETING"],
            "hi"
        );
    }

    #[test]
    fn v1_catalog_entries_require_supported_urls() {
        let mut value = v1_value();
        value["packages"][0]["locked_url"] =
            serde_json::json!("https://gitlab.com/example/snapshot");
        assert!(Lockfile::from_value(&value).is_err());
    }
}
