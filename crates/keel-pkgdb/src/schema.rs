//! SQL schema shared by the scraper (which writes indexes) and the read
//! side (which validates and queries them).

use keel_core::versions;

/// Index schema versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlVersions {
    /// The tables schema version. A mismatch invalidates the whole index.
    pub tables: u32,
    /// The views schema version. Views are re-derivable without
    /// invalidating data.
    pub views: u32,
}

/// The compiled schema versions.
pub const SQL_VERSIONS: SqlVersions = SqlVersions { tables: 2, views: 3 };

/// Names of the rows in `DbVersions` holding the schema versions.
pub const TABLES_VERSION_KEY: &str = "tables_schema";
pub const VIEWS_VERSION_KEY: &str = "views_schema";

/// Tables DDL.
///
/// `AttrSets` forms a tree rooted at `parent = 0`; the first level holds
/// subtree tags, the second system tags. `Descriptions` de-duplicates
/// description strings; `Packages.descriptionId = 0` means "no
/// description". The version ranking columns (`major`...`versionType`)
/// are computed at scrape time so that query ordering has stable inputs.
pub const TABLES_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS DbVersions (
  name     TEXT PRIMARY KEY
, version  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS LockedRef (
  fingerprint  TEXT PRIMARY KEY
, string       TEXT NOT NULL
, attrs        JSON NOT NULL
);

CREATE TABLE IF NOT EXISTS AttrSets (
  id        INTEGER PRIMARY KEY
, parent    INTEGER NOT NULL DEFAULT 0
, attrName  TEXT    NOT NULL
, done      BOOLEAN NOT NULL DEFAULT FALSE
, UNIQUE ( parent, attrName )
);

CREATE TABLE IF NOT EXISTS Descriptions (
  id           INTEGER PRIMARY KEY
, description  TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS Packages (
  id                INTEGER PRIMARY KEY
, parentId          INTEGER NOT NULL REFERENCES AttrSets ( id )
, attrName          TEXT    NOT NULL
, name              TEXT    NOT NULL
, pname             TEXT
, version           TEXT
, semver            TEXT
, major             INTEGER
, minor             INTEGER
, patch             INTEGER
, preTag            TEXT
, versionDate       TEXT
, versionType       INTEGER NOT NULL
, license           TEXT
, outputs           JSON    NOT NULL DEFAULT '[]'
, outputsToInstall  JSON
, broken            BOOLEAN
, unfree            BOOLEAN
, descriptionId     INTEGER NOT NULL DEFAULT 0
, UNIQUE ( parentId, attrName )
);
"#;

/// Views DDL.
///
/// `v_AttrPaths` walks the `AttrSets` tree to recover each attribute
/// set's subtree, system, and relative path. `v_PackagesSearch` is the
/// single surface the query engine selects from.
pub const VIEWS_DDL: &str = r#"
CREATE VIEW IF NOT EXISTS v_AttrPaths AS
WITH RECURSIVE tree ( id, subtree, system, relPath, depth ) AS (
  SELECT id, attrName, NULL, NULL, 0 FROM AttrSets WHERE ( parent = 0 )
  UNION ALL
  SELECT a.id
       , t.subtree
       , iif( t.depth = 0, a.attrName, t.system )
       , iif( t.depth = 0, json_array(), json_insert( t.relPath, '$[#]', a.attrName ) )
       , t.depth + 1
  FROM AttrSets a JOIN tree t ON ( a.parent = t.id )
)
SELECT * FROM tree;

CREATE VIEW IF NOT EXISTS v_PackagesSearch AS
SELECT p.id            AS id
     , p.attrName      AS attrName
     , p.name          AS name
     , p.pname         AS pname
     , p.version       AS version
     , p.semver        AS semver
     , p.major         AS major
     , p.minor         AS minor
     , p.patch         AS patch
     , p.preTag        AS preTag
     , p.versionDate   AS versionDate
     , p.versionType   AS versionType
     , p.license       AS license
     , p.broken        AS broken
     , p.unfree        AS unfree
     , iif( p.broken IS NULL, 1, iif( p.broken, 2, 0 ) ) AS brokenRank
     , iif( p.unfree IS NULL, 1, iif( p.unfree, 2, 0 ) ) AS unfreeRank
     , d.description   AS description
     , t.subtree       AS subtree
     , t.system        AS system
     , json_insert( t.relPath, '$[#]', p.attrName ) AS relPath
     , t.depth - 1     AS depth
FROM Packages p
     JOIN v_AttrPaths t ON ( p.parentId = t.id )
     LEFT JOIN Descriptions d ON ( p.descriptionId = d.id )
;
"#;

/// Version ranking columns derived from a package's version string at
/// scrape time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionColumns {
    pub semver: Option<String>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub patch: Option<i64>,
    pub pre_tag: Option<String>,
    pub version_date: Option<String>,
    pub version_type: i64,
}

/// Version classes as stored in `Packages.versionType`.
/// Semver sorts before dates, dates before opaque strings.
pub const VERSION_TYPE_SEMVER: i64 = 0;
pub const VERSION_TYPE_DATE: i64 = 1;
pub const VERSION_TYPE_OTHER: i64 = 2;
pub const VERSION_TYPE_NONE: i64 = 3;

/// Normalize a datestamp-like version to a sortable `YYYY-MM-DD` key.
fn date_key(version: &str) -> Option<String> {
    let digits: Vec<&str> = version.splitn(4, '-').collect();
    if digits.len() < 3 {
        return None;
    }
    let (year, month, day) = if digits[0].len() == 4 {
        (digits[0], digits[1], digits[2])
    } else {
        (digits[2], digits[0], digits[1])
    };
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    Some(format!("{year}-{month:02}-{day:02}"))
}

/// Classify a version string into its ranking columns.
pub fn version_columns(version: Option<&str>) -> VersionColumns {
    let Some(version) = version else {
        return VersionColumns {
            version_type: VERSION_TYPE_NONE,
            ..VersionColumns::default()
        };
    };

    if versions::is_date(version) {
        return VersionColumns {
            version_date: date_key(version),
            version_type: VERSION_TYPE_DATE,
            ..VersionColumns::default()
        };
    }

    if let Some(coerced) = versions::coerce_semver(version) {
        if let Ok(parsed) = semver_parts(&coerced) {
            return parsed;
        }
    }

    VersionColumns {
        version_type: VERSION_TYPE_OTHER,
        ..VersionColumns::default()
    }
}

fn semver_parts(coerced: &str) -> Result<VersionColumns, ()> {
    let (core, pre_tag) = match coerced.split_once('-') {
        Some((core, tag)) => (core, Some(tag.to_string())),
        None => (coerced, None),
    };
    let mut parts = core.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
    let minor = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
    let patch = parts.next().and_then(|p| p.parse().ok()).ok_or(())?;
    Ok(VersionColumns {
        semver: Some(coerced.to_string()),
        major: Some(major),
        minor: Some(minor),
        patch: Some(patch),
        pre_tag,
        version_date: None,
        version_type: VERSION_TYPE_SEMVER,
    })
}
