//! Opening and querying existing index files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::AttrPath;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::{debug, trace};

use crate::query::PkgQueryArgs;
use crate::schema::{SQL_VERSIONS, SqlVersions, TABLES_VERSION_KEY, VIEWS_VERSION_KEY};

/// A row index in an index table.
pub type RowId = i64;

/// Another process may hold the database while it is being written. We
/// retry with a small period but a large budget so that a slow writer
/// isn't mistaken for a wedged one.
pub const DB_RETRY_PERIOD: Duration = Duration::from_millis(100);
pub const DB_MAX_RETRIES: u32 = 2500;

/// Environment variable overriding the index cache directory.
pub const CACHEDIR_ENV_VAR: &str = "KEEL_PKGDB_CACHEDIR";

/// The fingerprint of a locked upstream reference, as stored in lockfiles
/// and used to derive index file names.
pub fn ref_fingerprint(url: &str) -> String {
    blake3::hash(url.as_bytes()).to_hex().to_string()
}

/// The directory under which index files live.
///
/// Respects [CACHEDIR_ENV_VAR] when set, otherwise a schema-versioned
/// subdirectory of the platform cache directory.
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CACHEDIR_ENV_VAR) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("keel")
        .join(format!("pkgdb-v{}", SQL_VERSIONS.tables))
}

/// Absolute path of the index file for a given fingerprint.
pub fn db_path(fingerprint: &str, cache_dir: &Path) -> PathBuf {
    cache_dir.join(format!("{fingerprint}.sqlite"))
}

/// The pinned upstream snapshot an index was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedRef {
    /// Locked URI string.
    pub string: String,
    /// Exploded form of the URI as an attribute set.
    pub attrs: serde_json::Value,
}

/// Metadata about a single package row.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRow {
    pub id: RowId,
    pub pname: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
    pub outputs: Vec<String>,
    pub outputs_to_install: Option<Vec<String>>,
    /// The full attribute path of the package.
    pub abs_path: Vec<String>,
    /// First element of the path.
    pub subtree: String,
    /// Second element of the path.
    pub system: String,
    /// The part of the path after `<subtree>.<system>`.
    pub rel_path: Vec<String>,
}

/// A read-only handle on one index file.
///
/// Multiple readers may share an index concurrently; the core never
/// writes to one.
#[derive(Debug)]
pub struct PkgDb {
    pub fingerprint: String,
    pub db_path: PathBuf,
    pub locked_ref: LockedRef,
    conn: Connection,
}

fn sql_error(err: rusqlite::Error) -> Error {
    Error::caught(ErrorKind::IndexError, "sqlite error", err)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::DatabaseBusy
                || failure.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Run `op`, retrying while the database reports itself busy, up to the
/// retry budget.
fn retry_while_busy<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                retries += 1;
                if retries > DB_MAX_RETRIES {
                    return Err(Error::msg(
                        ErrorKind::IndexError,
                        "database operation timed out",
                    ));
                }
                trace!(retries, "database busy, retrying");
                std::thread::sleep(DB_RETRY_PERIOD);
            }
            Err(err) => return Err(sql_error(err)),
        }
    }
}

impl PkgDb {
    /// Open an existing index file.
    ///
    /// Does NOT attempt to create an index if none exists.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if !db_path.exists() {
            return Err(Error::msg(
                ErrorKind::NoSuchDatabase,
                format!(
                    "no such database '{}'; scrape the snapshot to create it",
                    db_path.display()
                ),
            ));
        }

        debug!(path = %db_path.display(), "opening package index");
        let conn = retry_while_busy(|| {
            Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        })?;

        let versions = retry_while_busy(|| load_versions(&conn))?;
        if versions.tables != SQL_VERSIONS.tables {
            return Err(Error::msg(
                ErrorKind::SchemaMismatch,
                format!(
                    "index '{}' has tables schema version {} but version {} is required; \
                     re-scrape the snapshot",
                    db_path.display(),
                    versions.tables,
                    SQL_VERSIONS.tables
                ),
            ));
        }

        let (fingerprint, locked_ref) = retry_while_busy(|| load_locked_ref(&conn))??;

        Ok(PkgDb {
            fingerprint,
            db_path,
            locked_ref,
            conn,
        })
    }

    /// Open an index directly by its fingerprint, asserting that the
    /// fingerprint stored in the database matches.
    pub fn open_fingerprint(fingerprint: &str, cache_dir: &Path) -> Result<Self> {
        let db = Self::open(db_path(fingerprint, cache_dir))?;
        if db.fingerprint != fingerprint {
            return Err(Error::msg(
                ErrorKind::IndexError,
                format!(
                    "database '{}' fingerprint '{}' does not match expected '{}'",
                    db.db_path.display(),
                    db.fingerprint,
                    fingerprint
                ),
            ));
        }
        Ok(db)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The index schema versions.
    pub fn schema_version(&self) -> Result<SqlVersions> {
        load_versions(&self.conn).map_err(sql_error)
    }

    /// The pinned upstream snapshot this index was built from.
    pub fn locked_ref(&self) -> &LockedRef {
        &self.locked_ref
    }

    /// The `AttrSets.id` for a given path.
    pub fn get_attr_set_id(&self, path: &[String]) -> Result<RowId> {
        let mut row: RowId = 0;
        for part in path {
            let found: Option<RowId> = self
                .conn
                .query_row(
                    "SELECT id FROM AttrSets WHERE ( attrName = ?1 ) AND ( parent = ?2 ) LIMIT 1",
                    params![part, row],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_error)?;
            row = found.ok_or_else(|| {
                Error::msg(
                    ErrorKind::IndexError,
                    format!("no such attribute set '{}'", path.join(".")),
                )
            })?;
        }
        Ok(row)
    }

    /// Whether the index has an attribute set at `path`.
    pub fn has_attr_set(&self, path: &[String]) -> Result<bool> {
        let mut row: RowId = 0;
        for part in path {
            let found: Option<RowId> = self
                .conn
                .query_row(
                    "SELECT id FROM AttrSets WHERE ( attrName = ?1 ) AND ( parent = ?2 ) LIMIT 1",
                    params![part, row],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_error)?;
            match found {
                Some(id) => row = id,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Whether scraping has fully populated the attribute set with the
    /// given id. A parent marked complete transitively completes its
    /// descendants, which is handled by the path form below.
    pub fn completed_attr_set_id(&self, row: RowId) -> Result<bool> {
        let done: Option<bool> = self
            .conn
            .query_row(
                "SELECT done FROM AttrSets WHERE id = ?1",
                params![row],
                |r| r.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        Ok(done.unwrap_or(false))
    }

    /// Whether scraping has fully populated the attribute set at `path`.
    pub fn completed_attr_set(&self, path: &[String]) -> Result<bool> {
        let mut row: RowId = 0;
        for part in path {
            let found: Option<(RowId, bool)> = self
                .conn
                .query_row(
                    "SELECT id, done FROM AttrSets \
                     WHERE ( attrName = ?1 ) AND ( parent = ?2 ) LIMIT 1",
                    params![part, row],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(sql_error)?;
            match found {
                None => return Ok(false),
                Some((_, true)) => return Ok(true),
                Some((id, false)) => row = id,
            }
        }
        Ok(false)
    }

    /// The attribute path for a given `AttrSets.id`.
    pub fn get_attr_set_path(&self, mut row: RowId) -> Result<AttrPath> {
        let mut path = Vec::new();
        while row != 0 {
            let found: Option<(RowId, String)> = self
                .conn
                .query_row(
                    "SELECT parent, attrName FROM AttrSets WHERE ( id = ?1 )",
                    params![row],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(sql_error)?;
            let (parent, attr_name) = found.ok_or_else(|| {
                Error::msg(ErrorKind::IndexError, format!("no such AttrSets.id {row}"))
            })?;
            path.push(attr_name);
            row = parent;
        }
        path.reverse();
        Ok(path)
    }

    /// The `Packages.id` for a given path.
    pub fn get_package_id(&self, path: &[String]) -> Result<RowId> {
        let (attr_name, parent_path) = path.split_last().ok_or_else(|| {
            Error::msg(ErrorKind::IndexError, "package path may not be empty")
        })?;
        let parent = self.get_attr_set_id(parent_path)?;
        let found: Option<RowId> = self
            .conn
            .query_row(
                "SELECT id FROM Packages WHERE ( parentId = ?1 ) AND ( attrName = ?2 )",
                params![parent, attr_name],
                |r| r.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        found.ok_or_else(|| {
            Error::msg(
                ErrorKind::IndexError,
                format!("no such package '{}'", path.join(".")),
            )
        })
    }

    /// The attribute path for a given `Packages.id`.
    pub fn get_package_path(&self, row: RowId) -> Result<AttrPath> {
        let found: Option<(RowId, String)> = self
            .conn
            .query_row(
                "SELECT parentId, attrName FROM Packages WHERE ( id = ?1 )",
                params![row],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(sql_error)?;
        let (parent, attr_name) = found.ok_or_else(|| {
            Error::msg(ErrorKind::IndexError, format!("no such Packages.id {row}"))
        })?;
        let mut path = self.get_attr_set_path(parent)?;
        path.push(attr_name);
        Ok(path)
    }

    /// Whether the index has a package at `path`.
    pub fn has_package(&self, path: &[String]) -> Result<bool> {
        let Some((attr_name, parent_path)) = path.split_last() else {
            return Ok(false);
        };
        let mut row: RowId = 0;
        for part in parent_path {
            let found: Option<RowId> = self
                .conn
                .query_row(
                    "SELECT id FROM AttrSets WHERE ( attrName = ?1 ) AND ( parent = ?2 ) LIMIT 1",
                    params![part, row],
                    |r| r.get(0),
                )
                .optional()
                .map_err(sql_error)?;
            match found {
                Some(id) => row = id,
                None => return Ok(false),
            }
        }
        let found: Option<RowId> = self
            .conn
            .query_row(
                "SELECT id FROM Packages WHERE ( parentId = ?1 ) AND ( attrName = ?2 ) LIMIT 1",
                params![row, attr_name],
                |r| r.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        Ok(found.is_some())
    }

    /// The description string for a given `Descriptions.id`.
    /// Id `0` yields the empty string.
    pub fn get_description(&self, description_id: RowId) -> Result<String> {
        if description_id == 0 {
            return Ok(String::new());
        }
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT description FROM Descriptions WHERE id = ?1",
                params![description_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        found.ok_or_else(|| {
            Error::msg(
                ErrorKind::IndexError,
                format!("no such Descriptions.id {description_id}"),
            )
        })
    }

    /// Ordered list of `Packages.id`s satisfying a set of requirements.
    pub fn get_packages(&self, args: &PkgQueryArgs) -> Result<Vec<RowId>> {
        crate::query::PkgQuery::new(args.clone())?.execute(self)
    }

    /// Metadata about a single package row.
    pub fn get_package(&self, row: RowId) -> Result<PackageRow> {
        let found = self
            .conn
            .query_row(
                "SELECT pname, version, license, broken, unfree, \
                        outputs, outputsToInstall, descriptionId \
                 FROM Packages WHERE ( id = ?1 )",
                params![row],
                |r| {
                    Ok((
                        r.get::<_, Option<String>>(0)?,
                        r.get::<_, Option<String>>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<bool>>(3)?,
                        r.get::<_, Option<bool>>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, RowId>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_error)?;
        let (pname, version, license, broken, unfree, outputs, outputs_to_install, description_id) =
            found.ok_or_else(|| {
                Error::msg(ErrorKind::IndexError, format!("no such Packages.id {row}"))
            })?;

        let outputs: Vec<String> = serde_json::from_str(&outputs)
            .map_err(|err| Error::caught(ErrorKind::PackageInit, "couldn't parse outputs", err))?;
        let outputs_to_install: Option<Vec<String>> = outputs_to_install
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|err| {
                Error::caught(ErrorKind::PackageInit, "couldn't parse outputsToInstall", err)
            })?;

        let description = match description_id {
            0 => None,
            id => Some(self.get_description(id)?),
        };

        let abs_path = self.get_package_path(row)?;
        if abs_path.len() < 3 {
            return Err(Error::msg(
                ErrorKind::PackageInit,
                format!("package path '{}' is too short", abs_path.join(".")),
            ));
        }
        let subtree = abs_path[0].clone();
        let system = abs_path[1].clone();
        let rel_path = abs_path[2..].to_vec();

        Ok(PackageRow {
            id: row,
            pname,
            version,
            description,
            license,
            broken,
            unfree,
            outputs,
            outputs_to_install,
            abs_path,
            subtree,
            system,
            rel_path,
        })
    }
}

fn load_versions(conn: &Connection) -> rusqlite::Result<SqlVersions> {
    let tables: String = conn.query_row(
        "SELECT version FROM DbVersions WHERE name = ?1",
        params![TABLES_VERSION_KEY],
        |r| r.get(0),
    )?;
    let views: String = conn.query_row(
        "SELECT version FROM DbVersions WHERE name = ?1",
        params![VIEWS_VERSION_KEY],
        |r| r.get(0),
    )?;
    Ok(SqlVersions {
        tables: tables.parse().unwrap_or(0),
        views: views.parse().unwrap_or(0),
    })
}

fn load_locked_ref(conn: &Connection) -> rusqlite::Result<Result<(String, LockedRef)>> {
    let (fingerprint, string, attrs): (String, String, String) = conn.query_row(
        "SELECT fingerprint, string, attrs FROM LockedRef LIMIT 1",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    Ok(match serde_json::from_str(&attrs) {
        Ok(attrs) => Ok((fingerprint, LockedRef { string, attrs })),
        Err(err) => Err(Error::caught(
            ErrorKind::IndexError,
            "couldn't parse locked reference attributes",
            err,
        )),
    })
}
