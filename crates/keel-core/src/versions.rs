//! Version number analysis.
//!
//! Version strings fall into three disjoint classes, tested in order:
//! strict semantic versions, datestamp-like versions, and strings that can
//! be coerced to a semantic version (`v1`, `1.0`, `foo@1.2`, ...).
//! Anything else is treated as an opaque string matched exactly.
//!
//! Range satisfaction ([semver_sat]) follows `node-semver` conventions:
//! prefix operators, `A - B` hyphen ranges, `||` alternatives, `x`/`X`/`*`
//! wildcard segments, and prerelease versions as candidates.

use std::sync::LazyLock;

use regex::Regex;
use semver::{Prerelease, Version, VersionReq};

/// Matches semantic version strings, e.g. `4.2.0-pre`.
static SEMVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0|[1-9][0-9]*)\.(0|[1-9][0-9]*)\.(0|[1-9][0-9]*)(-[-0-9A-Za-z_+.]+)?$").unwrap()
});

/// Coercively matches semantic version strings, e.g. `v1.0-pre`.
static SEMVER_COERCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*@)?[vV]?(0*([0-9]+)(\.0*([0-9]+)(\.0*([0-9]+))?)?(-[-0-9A-Za-z_+.]+)?)$")
        .unwrap()
});

/// Matches `-` separated date strings, e.g. `2023-05-31` or `5-1-2023`.
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([12][0-9][0-9][0-9]-[0-1]?[0-9]-[0-3]?[0-9]|[0-1]?[0-9]-[0-3]?[0-9]-[12][0-9][0-9][0-9])(-[-0-9A-Za-z_+.]+)?$",
    )
    .unwrap()
});

/// Matches a range whose first token is a loose version with an optional
/// prefix modifier.
static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(>=|<=|\^|~|>|<|=)?\s*(0|[1-9][0-9]*)(\.(0|[1-9][0-9]*)(\.(0|[1-9][0-9]*))?)?(-[-0-9A-Za-z_+.]+)?.*$",
    )
    .unwrap()
});

/// Special range tokens, including the empty string.
static RANGE_GLOB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\*|any|latest)?\s*$").unwrap());

/// Whether `version` is a strict semantic version string.
pub fn is_semver(version: &str) -> bool {
    SEMVER_RE.is_match(version)
}

/// Whether `version` is a datestamp-like version string.
pub fn is_date(version: &str) -> bool {
    DATE_RE.is_match(version)
}

/// Whether `version` can be interpreted as a semantic version.
pub fn is_coercible_to_semver(version: &str) -> bool {
    !DATE_RE.is_match(version) && SEMVER_COERCE_RE.is_match(version)
}

/// Whether `version` is a valid semantic version range.
///
/// This is a best effort detection used to distinguish ranges from static
/// versions: it checks that the first token is a loose version with an
/// optional modifier, a `4.2.0 - 5.3.1` style range, or a special token.
/// Exact version matches such as `4.2.0` count as ranges, as do the empty
/// string, `*`, `any`, and `latest`.
pub fn is_semver_range(range: &str) -> bool {
    RANGE_RE.is_match(range) || RANGE_GLOB_RE.is_match(range) || range.contains(" - ")
}

/// Attempt to coerce strings such as `v1.0.2` or `1.0` to valid semantic
/// version strings, padding missing components with `0`.
///
/// Returns [None] for datestamp-like strings and anything else that cannot
/// be interpreted as a semantic version.
pub fn coerce_semver(version: &str) -> Option<String> {
    if SEMVER_RE.is_match(version) {
        return Some(version.to_string());
    }
    if DATE_RE.is_match(version) {
        return None;
    }
    let caps = SEMVER_COERCE_RE.captures(version)?;

    let major = caps.get(3).map(|m| m.as_str()).unwrap_or("0");
    let minor = caps.get(5).map(|m| m.as_str()).unwrap_or("0");
    let patch = caps.get(7).map(|m| m.as_str()).unwrap_or("0");
    let tag = caps.get(8).map(|m| m.as_str()).unwrap_or("");

    Some(format!("{major}.{minor}.{patch}{tag}"))
}

/// Strip `*`, `x`, and `X` wildcard segments from a range, dropping the
/// trailing `.` so that `18.x` becomes `18`.
pub fn clean_range(range: &str) -> String {
    let chars: Vec<char> = range.chars().collect();
    let mut rsl = String::with_capacity(range.len());
    let mut idx = 0;
    while idx < chars.len() {
        let chr = chars[idx];
        if chr != '*' && chr != 'x' && chr != 'X' {
            rsl.push(chr);
            idx += 1;
            continue;
        }
        if rsl.ends_with('.') {
            rsl.pop();
        }
        while idx < chars.len()
            && chars[idx] != ' '
            && chars[idx] != ','
            && chars[idx] != '&'
            && chars[idx] != '|'
        {
            idx += 1;
        }
        if idx < chars.len() {
            rsl.push(chars[idx]);
            idx += 1;
        }
    }
    rsl
}

/// A parsed range: `||` separated alternatives, each a conjunction
/// of comparators.
struct NodeRange {
    alternatives: Vec<VersionReq>,
}

impl NodeRange {
    fn parse(range: &str) -> Option<Self> {
        let mut alternatives = Vec::new();
        for alt in range.split("||") {
            alternatives.push(parse_alternative(alt)?);
        }
        Some(NodeRange { alternatives })
    }

    fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| {
            if req.matches(version) {
                return true;
            }
            // Prerelease versions are candidates even when the comparator
            // doesn't mention one.
            if !version.pre.is_empty() {
                let mut cleared = version.clone();
                cleared.pre = Prerelease::EMPTY;
                return req.matches(&cleared);
            }
            false
        })
    }
}

/// The upper bound of a hyphen range; a partial bound is inclusive of
/// everything it abbreviates, so `1.2 - 2.3` means `>=1.2.0, <2.4.0`.
fn hyphen_upper_bound(upper: &str) -> Option<String> {
    if is_semver(upper) {
        return Some(format!("<={upper}"));
    }
    let parts: Vec<&str> = upper.split('.').collect();
    match parts.as_slice() {
        [major] => {
            let major: u64 = major.parse().ok()?;
            Some(format!("<{}.0.0", major + 1))
        }
        [major, minor] => {
            let minor: u64 = minor.parse().ok()?;
            Some(format!("<{major}.{}.0", minor + 1))
        }
        _ => None,
    }
}

fn parse_alternative(alt: &str) -> Option<VersionReq> {
    let alt = alt.trim();
    if alt.is_empty() || alt == "*" || alt == "any" || alt == "latest" {
        return Some(VersionReq::STAR);
    }

    if let Some((lower, upper)) = alt.split_once(" - ") {
        let lower = coerce_semver(lower.trim())?;
        let upper = hyphen_upper_bound(upper.trim())?;
        return VersionReq::parse(&format!(">={lower}, {upper}")).ok();
    }

    // Space separated comparators are a conjunction. An operator may be
    // separated from its version by whitespace.
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alt.split_whitespace() {
        if matches!(token, ">" | "<" | ">=" | "<=" | "=" | "^" | "~") {
            pending_op = Some(token);
            continue;
        }
        let comparator = match pending_op.take() {
            Some(op) => format!("{op}{token}"),
            None => normalize_bare(token),
        };
        comparators.push(comparator);
    }
    if comparators.is_empty() {
        return None;
    }
    VersionReq::parse(&comparators.join(", ")).ok()
}

/// A bare version token: a full `x.y.z` means an exact match, a partial
/// one means "anything it abbreviates" (`1.2` is `1.2.x`).
fn normalize_bare(token: &str) -> String {
    if token.starts_with(|chr: char| "><=^~".contains(chr)) {
        return token.to_string();
    }
    if is_semver(token) {
        format!("={token}")
    } else {
        format!("~{token}")
    }
}

/// Filter `versions` by a semantic version range, preserving input order.
///
/// Versions that do not parse as (coercible) semantic versions are
/// dropped, as is everything when the range itself does not parse.
pub fn semver_sat(range: &str, versions: &[String]) -> Vec<String> {
    let Some(parsed) = NodeRange::parse(&clean_range(range)) else {
        return Vec::new();
    };
    versions
        .iter()
        .filter(|version| {
            let coerced = match coerce_semver(version) {
                Some(coerced) => coerced,
                None => return false,
            };
            match Version::parse(&coerced) {
                Ok(version) => parsed.matches(&version),
                Err(_) => false,
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn classifies_semvers() {
        assert!(is_semver("4.2.0"));
        assert!(is_semver("4.2.0-pre"));
        assert!(is_semver("0.0.1"));
        assert!(!is_semver("4.2"));
        assert!(!is_semver("v4.2.0"));
        assert!(!is_semver("04.2.0"));
        assert!(!is_semver("2023-05-31"));
    }

    #[test]
    fn classifies_dates() {
        assert!(is_date("2023-05-31"));
        assert!(is_date("5-1-2023"));
        assert!(is_date("2023-05-31-pre"));
        assert!(!is_date("4.2.0"));
        assert!(!is_date("2023"));
    }

    #[test]
    fn classifies_coercible() {
        assert!(is_coercible_to_semver("v1"));
        assert!(is_coercible_to_semver("1.0"));
        assert!(is_coercible_to_semver("foo@1.2"));
        assert!(is_coercible_to_semver("4.2.0"));
        assert!(!is_coercible_to_semver("2023-05-31"));
        assert!(!is_coercible_to_semver("not-a-version"));
    }

    #[test]
    fn coerces_loose_versions() {
        assert_eq!(coerce_semver("1").as_deref(), Some("1.0.0"));
        assert_eq!(coerce_semver("v1.0").as_deref(), Some("1.0.0"));
        assert_eq!(coerce_semver("foo@v1.02.0-pre").as_deref(), Some("1.2.0-pre"));
        assert_eq!(coerce_semver("4.2.0").as_deref(), Some("4.2.0"));
        assert_eq!(coerce_semver("1-beta").as_deref(), Some("1.0.0-beta"));
        assert_eq!(coerce_semver("2023-05-31"), None);
        assert_eq!(coerce_semver("not-a-version"), None);
    }

    #[test]
    fn recognizes_ranges() {
        assert!(is_semver_range("^1.2"));
        assert!(is_semver_range("~1.2.3"));
        assert!(is_semver_range(">=2"));
        assert!(is_semver_range("4.2.0"));
        assert!(is_semver_range("4.2.0 - 5.3.1"));
        assert!(is_semver_range("*"));
        assert!(is_semver_range("any"));
        assert!(is_semver_range("latest"));
        assert!(is_semver_range(""));
        assert!(is_semver_range("18.x"));
        assert!(!is_semver_range("not!a@version"));
    }

    #[test]
    fn cleans_wildcard_segments() {
        assert_eq!(clean_range("18.x"), "18");
        assert_eq!(clean_range("1.2.*"), "1.2");
        assert_eq!(clean_range(">=1.0 <2.X"), ">=1.0 <2");
        assert_eq!(clean_range("^1.2.3"), "^1.2.3");
    }

    fn versions(list: &[&str]) -> Vec<String> {
        list.iter().map(|version| version.to_string()).collect()
    }

    #[test]
    fn satisfies_caret_ranges() {
        let sat = semver_sat(
            "^2.12",
            &versions(&["2.12.0", "2.12.1-pre", "2.13.0", "1.0.0", "3.0.0"]),
        );
        assert_eq!(sat, versions(&["2.12.0", "2.12.1-pre", "2.13.0"]));
    }

    #[test]
    fn satisfies_hyphen_ranges() {
        let sat = semver_sat("1.0 - 2.0", &versions(&["0.9.0", "1.0.0", "1.5.3", "2.0.0", "2.1.0"]));
        assert_eq!(sat, versions(&["1.0.0", "1.5.3", "2.0.0"]));
    }

    #[test]
    fn satisfies_wildcards_and_conjunctions() {
        let all = versions(&["1.0.0", "18.2.0", "19.0.0"]);
        assert_eq!(semver_sat("*", &all), all);
        assert_eq!(semver_sat("18.x", &all), versions(&["18.2.0"]));
        assert_eq!(semver_sat(">=18 <19", &all), versions(&["18.2.0"]));
        assert_eq!(semver_sat("1.0.0 || 19", &all), versions(&["1.0.0", "19.0.0"]));
    }

    #[test]
    fn bare_partial_versions_mean_their_whole_series() {
        let all = versions(&["1.2.0", "1.2.9", "1.3.0"]);
        assert_eq!(semver_sat("1.2", &all), versions(&["1.2.0", "1.2.9"]));
        assert_eq!(semver_sat("1.2.0", &all), versions(&["1.2.0"]));
    }

    #[test]
    fn unparseable_ranges_and_versions_drop_out() {
        assert_eq!(semver_sat("^1", &versions(&["nonsense"])), Vec::<String>::new());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// At most one of the three classifications holds for
            /// any string.
            #[test]
            fn classification_is_disjoint(s in any::<String>()) {
                let strict = is_semver(&s);
                let date = is_date(&s);
                let coercible_only = is_coercible_to_semver(&s) && !is_semver(&s);
                prop_assert!(u32::from(strict) + u32::from(date) + u32::from(coercible_only) <= 1);
            }

            /// Whatever coercion produces is a strict semantic version.
            #[test]
            fn coercion_round_trips(s in any::<String>()) {
                if let Some(coerced) = coerce_semver(&s) {
                    prop_assert!(is_semver(&coerced), "coerced '{s}' to non-semver '{coerced}'");
                }
            }
        }
    }
}
