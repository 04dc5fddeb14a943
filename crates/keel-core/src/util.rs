//! Miscellaneous helpers: attribute path splitting, whitespace trimming,
//! and coercion of TOML/YAML/JSON input to a common JSON value.

use std::path::Path;

use crate::error::{Error, ErrorKind, Result};
use crate::types::AttrPathGlob;

/// Remove outer paired quotes from a path segment and resolve `\x`
/// escapes to `x`.
fn dequote(part: &str) -> String {
    let chars: Vec<char> = part.chars().collect();
    let mut start = 0;
    let mut end = chars.len();

    if chars.len() >= 2 {
        let (first, last) = (chars[0], chars[chars.len() - 1]);
        if (first == '\'' && last == '\'') || (first == '"' && last == '"') {
            start += 1;
            end -= 1;
        }
    }

    let mut rsl = String::with_capacity(end - start);
    let mut was_escaped = false;
    for &chr in &chars[start..end] {
        if was_escaped {
            was_escaped = false;
        } else if chr == '\\' {
            was_escaped = true;
            continue;
        }
        rsl.push(chr);
    }
    rsl
}

/// Split an attribute path string on `.`, respecting paired single or
/// double quotes and `\` escaping of any single character.
pub fn split_attr_path(path: &str) -> Vec<String> {
    let chars: Vec<char> = path.chars().collect();
    let mut parts = Vec::new();

    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut was_escaped = false;
    let mut start = 0;

    for (idx, &chr) in chars.iter().enumerate() {
        if was_escaped {
            was_escaped = false;
        } else if chr == '\\' {
            was_escaped = true;
        } else if chr == '\'' && !in_double_quote {
            in_single_quote = !in_single_quote;
        } else if chr == '"' && !in_single_quote {
            in_double_quote = !in_double_quote;
        } else if chr == '.' && !in_single_quote && !in_double_quote {
            parts.push(dequote(&chars[start..idx].iter().collect::<String>()));
            start = idx + 1;
        }
    }

    if start != chars.len() {
        parts.push(dequote(&chars[start..].iter().collect::<String>()));
    }

    parts
}

/// Render a globbed attribute path for display, with `*` in place
/// of globs.
pub fn display_globbed_path(attrs: &AttrPathGlob) -> String {
    attrs
        .iter()
        .map(|attr| attr.as_deref().unwrap_or("*"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Merge two vectors, keeping all elements of the higher priority vector
/// first and appending the deduplicated elements of the lower one.
pub fn merge_vectors<T: Clone + PartialEq>(lower: &[T], higher: &[T]) -> Vec<T> {
    let mut merged = higher.to_vec();
    for value in lower {
        if !merged.contains(value) {
            merged.push(value.clone());
        }
    }
    merged
}

/// Trim whitespace from the start, in place.
pub fn ltrim(s: &mut String) {
    let trimmed = s.trim_start();
    let offset = s.len() - trimmed.len();
    if offset > 0 {
        s.drain(..offset);
    }
}

/// Trim whitespace from the end, in place.
pub fn rtrim(s: &mut String) {
    let trimmed_len = s.trim_end().len();
    s.truncate(trimmed_len);
}

/// Trim whitespace from both ends, in place.
pub fn trim(s: &mut String) {
    rtrim(s);
    ltrim(s);
}

/// Trim whitespace from the start, copying.
pub fn ltrim_copy(s: &str) -> String {
    s.trim_start().to_string()
}

/// Trim whitespace from the end, copying.
pub fn rtrim_copy(s: &str) -> String {
    s.trim_end().to_string()
}

/// Trim whitespace from both ends, copying.
pub fn trim_copy(s: &str) -> String {
    s.trim().to_string()
}

/// Convert a TOML document to a JSON value.
pub fn toml_to_json(content: &str) -> Result<serde_json::Value> {
    let value: toml::Value = toml::from_str(content)
        .map_err(|err| Error::caught(ErrorKind::TomlToJson, "couldn't parse TOML", err))?;
    serde_json::to_value(value)
        .map_err(|err| Error::caught(ErrorKind::TomlToJson, "couldn't convert TOML to JSON", err))
}

/// Convert a YAML document to a JSON value.
pub fn yaml_to_json(content: &str) -> Result<serde_json::Value> {
    serde_yaml::from_str(content)
        .map_err(|err| Error::caught(ErrorKind::YamlToJson, "couldn't parse YAML", err))
}

/// Read a file and coerce its contents to JSON based on its extension.
///
/// `.json` and `.lock` files parse directly, `.yaml`/`.yml` convert from
/// YAML, and `.toml` converts from TOML.
pub fn read_to_json(path: &Path) -> Result<serde_json::Value> {
    if !path.exists() {
        return Err(Error::msg(
            ErrorKind::InvalidArg,
            format!("no such path: {}", path.display()),
        ));
    }
    let content = std::fs::read_to_string(path).map_err(|err| {
        Error::caught(
            ErrorKind::InvalidArg,
            format!("couldn't read {}", path.display()),
            err,
        )
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") | Some("lock") => serde_json::from_str(&content).map_err(|err| {
            Error::caught(
                ErrorKind::InvalidArg,
                format!("couldn't parse {}", path.display()),
                err,
            )
        }),
        Some("yaml") | Some("yml") => yaml_to_json(&content),
        Some("toml") => toml_to_json(&content),
        other => Err(Error::msg(
            ErrorKind::InvalidArg,
            format!(
                "cannot convert file extension '{}' to JSON",
                other.unwrap_or("")
            ),
        )),
    }
}

/// Parse a JSON object from an inline string, or read it from a path.
pub fn parse_or_read_json(json_or_path: &str) -> Result<serde_json::Value> {
    if json_or_path.contains('{') {
        serde_json::from_str(json_or_path)
            .map_err(|err| Error::caught(ErrorKind::InvalidArg, "couldn't parse inline JSON", err))
    } else {
        read_to_json(Path::new(json_or_path))
    }
}
