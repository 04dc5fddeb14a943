//! Test support: builds small index files so that read-side and resolver
//! tests can run against real databases.
//!
//! This module stands in for the scraper, which lives outside this
//! workspace; it writes the same schema the scraper produces.

use std::collections::HashMap;
use std::path::Path;

use keel_core::error::{Error, ErrorKind, Result};
use rusqlite::{Connection, params};

use crate::read::{RowId, db_path, ref_fingerprint};
use crate::schema::{
    SQL_VERSIONS, TABLES_DDL, TABLES_VERSION_KEY, VIEWS_DDL, VIEWS_VERSION_KEY, version_columns,
};

/// One package to insert into a test index.
#[derive(Debug, Clone)]
pub struct TestPackage {
    pub abs_path: Vec<String>,
    pub pname: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
    pub outputs: Vec<String>,
    pub outputs_to_install: Option<Vec<String>>,
}

impl TestPackage {
    pub fn new(abs_path: &[&str], pname: &str, version: Option<&str>) -> Self {
        TestPackage {
            abs_path: abs_path.iter().map(|part| part.to_string()).collect(),
            pname: pname.to_string(),
            version: version.map(|version| version.to_string()),
            description: None,
            license: None,
            broken: Some(false),
            unfree: Some(false),
            outputs: vec!["out".to_string()],
            outputs_to_install: Some(vec!["out".to_string()]),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn license(mut self, license: &str) -> Self {
        self.license = Some(license.to_string());
        self
    }

    pub fn broken(mut self, broken: bool) -> Self {
        self.broken = Some(broken);
        self
    }

    pub fn unfree(mut self, unfree: bool) -> Self {
        self.unfree = Some(unfree);
        self
    }

    /// The full package name, `<pname>-<version>`.
    fn name(&self) -> String {
        match &self.version {
            Some(version) => format!("{}-{}", self.pname, version),
            None => self.pname.clone(),
        }
    }
}

fn sql_error(err: rusqlite::Error) -> Error {
    Error::caught(ErrorKind::IndexError, "sqlite error", err)
}

/// Write an index for the snapshot locked at `locked_url` into
/// `cache_dir`, returning its fingerprint.
///
/// Every attribute set along each package's path is created and the
/// system level prefixes are marked complete.
pub fn write_index(
    cache_dir: &Path,
    locked_url: &str,
    locked_attrs: serde_json::Value,
    packages: &[TestPackage],
) -> Result<String> {
    let fingerprint = ref_fingerprint(locked_url);
    std::fs::create_dir_all(cache_dir).map_err(|err| {
        Error::caught(ErrorKind::IndexError, "couldn't create cache directory", err)
    })?;
    let path = db_path(&fingerprint, cache_dir);
    let conn = Connection::open(&path).map_err(sql_error)?;

    conn.execute_batch(TABLES_DDL).map_err(sql_error)?;
    conn.execute_batch(VIEWS_DDL).map_err(sql_error)?;
    conn.execute(
        "INSERT OR REPLACE INTO DbVersions ( name, version ) VALUES ( ?1, ?2 ), ( ?3, ?4 )",
        params![
            TABLES_VERSION_KEY,
            SQL_VERSIONS.tables.to_string(),
            VIEWS_VERSION_KEY,
            SQL_VERSIONS.views.to_string(),
        ],
    )
    .map_err(sql_error)?;
    conn.execute(
        "INSERT OR REPLACE INTO LockedRef ( fingerprint, string, attrs ) VALUES ( ?1, ?2, ?3 )",
        params![fingerprint, locked_url, locked_attrs.to_string()],
    )
    .map_err(sql_error)?;

    let mut attr_sets: HashMap<(RowId, String), RowId> = HashMap::new();
    let mut descriptions: HashMap<String, RowId> = HashMap::new();

    for package in packages {
        let (attr_name, prefix) = package.abs_path.split_last().ok_or_else(|| {
            Error::msg(ErrorKind::InvalidArg, "test package path may not be empty")
        })?;

        let mut parent: RowId = 0;
        for (depth, part) in prefix.iter().enumerate() {
            let key = (parent, part.clone());
            parent = match attr_sets.get(&key) {
                Some(id) => *id,
                None => {
                    // System level prefixes count as fully scraped.
                    let done = depth == 1;
                    conn.execute(
                        "INSERT OR IGNORE INTO AttrSets ( parent, attrName, done ) \
                         VALUES ( ?1, ?2, ?3 )",
                        params![key.0, part, done],
                    )
                    .map_err(sql_error)?;
                    let id: RowId = conn
                        .query_row(
                            "SELECT id FROM AttrSets \
                             WHERE ( parent = ?1 ) AND ( attrName = ?2 )",
                            params![key.0, part],
                            |r| r.get(0),
                        )
                        .map_err(sql_error)?;
                    attr_sets.insert(key, id);
                    id
                }
            };
        }

        let description_id: RowId = match &package.description {
            None => 0,
            Some(description) => match descriptions.get(description) {
                Some(id) => *id,
                None => {
                    conn.execute(
                        "INSERT OR IGNORE INTO Descriptions ( description ) VALUES ( ?1 )",
                        params![description],
                    )
                    .map_err(sql_error)?;
                    let id: RowId = conn
                        .query_row(
                            "SELECT id FROM Descriptions WHERE ( description = ?1 )",
                            params![description],
                            |r| r.get(0),
                        )
                        .map_err(sql_error)?;
                    descriptions.insert(description.clone(), id);
                    id
                }
            },
        };

        let columns = version_columns(package.version.as_deref());
        conn.execute(
            "INSERT INTO Packages ( parentId, attrName, name, pname, version, semver \
                                  , major, minor, patch, preTag, versionDate, versionType \
                                  , license, outputs, outputsToInstall, broken, unfree \
                                  , descriptionId ) \
             VALUES ( ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12 \
                    , ?13, ?14, ?15, ?16, ?17, ?18 )",
            params![
                parent,
                attr_name,
                package.name(),
                package.pname,
                package.version,
                columns.semver,
                columns.major,
                columns.minor,
                columns.patch,
                columns.pre_tag,
                columns.version_date,
                columns.version_type,
                package.license,
                serde_json::json!(package.outputs).to_string(),
                package
                    .outputs_to_install
                    .as_ref()
                    .map(|outputs| serde_json::json!(outputs).to_string()),
                package.broken,
                package.unfree,
                description_id,
            ],
        )
        .map_err(sql_error)?;
    }

    Ok(fingerprint)
}
