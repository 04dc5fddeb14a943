//! Construction of ranked package queries.
//!
//! A query is translated into a single SQL statement against
//! `v_PackagesSearch` plus a semver post-filter: SQL cannot evaluate
//! semantic version ranges, so the ordered `(id, semver)` rows are
//! filtered afterwards, preserving their order.

use keel_core::error::{Error, ErrorKind, Result};
use keel_core::types::{AttrPath, Subtree, System, current_system, is_supported_system};
use keel_core::versions;
use rusqlite::types::ToSql;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::trace;

use crate::read::{PkgDb, RowId};

/// Parameters used to look up packages in an index.
///
/// These combine SQL filtering/ordering with post-processing to produce
/// an ordered list of satisfactory packages.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PkgQueryArgs {
    /// Filter results by exact `name`.
    pub name: Option<String>,
    /// Filter results by exact `pname`.
    pub pname: Option<String>,
    /// Filter results by exact version.
    pub version: Option<String>,
    /// Filter results by a semantic version range.
    pub semver: Option<String>,
    /// Filter results by partial match on `pname`, `attrName`,
    /// or `description`.
    pub partial_match: Option<String>,
    /// Filter results by partial match on `pname` or `attrName`.
    pub partial_name_match: Option<String>,
    /// Filter results by an exact match on either `pname` or `attrName`.
    pub pname_or_attr_name: Option<String>,
    /// Filter results to those explicitly marked with one of the given
    /// licenses (SPDX ids).
    pub licenses: Option<Vec<String>>,
    /// Whether to include packages explicitly marked broken.
    pub allow_broken: bool,
    /// Whether to include packages explicitly marked unfree.
    pub allow_unfree: bool,
    /// Whether pre-release versions should be ordered before releases.
    pub prefer_pre_releases: bool,
    /// Subtrees to search, in priority order.
    pub subtrees: Option<Vec<Subtree>>,
    /// Systems to search, in priority order.
    pub systems: Vec<System>,
    /// Relative attribute path to match exactly.
    pub rel_path: Option<AttrPath>,
}

impl Default for PkgQueryArgs {
    fn default() -> Self {
        PkgQueryArgs {
            name: None,
            pname: None,
            version: None,
            semver: None,
            partial_match: None,
            partial_name_match: None,
            pname_or_attr_name: None,
            licenses: None,
            allow_broken: false,
            allow_unfree: true,
            prefer_pre_releases: false,
            subtrees: None,
            systems: vec![current_system()],
            rel_path: None,
        }
    }
}

impl PkgQueryArgs {
    /// Parse a structured query from its JSON projection.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|err| {
            Error::caught(ErrorKind::ParseSearchQuery, "couldn't interpret query", err)
        })
    }

    /// Sanity check parameters, failing before any SQL executes.
    pub fn check(&self) -> Result<()> {
        if self.name.is_some()
            && (self.pname.is_some() || self.version.is_some() || self.semver.is_some())
        {
            return Err(Error::msg(
                ErrorKind::InvalidQueryArg,
                "queries may not mix 'name' with any of 'pname', 'version', or 'semver'",
            ));
        }

        if self.version.is_some() && self.semver.is_some() {
            return Err(Error::msg(
                ErrorKind::InvalidQueryArg,
                "queries may not mix 'version' and 'semver'",
            ));
        }

        if self.partial_match.is_some() && self.partial_name_match.is_some() {
            return Err(Error::msg(
                ErrorKind::InvalidQueryArg,
                "'partialMatch' and 'partialNameMatch' filters may not be used together",
            ));
        }

        if let Some(licenses) = &self.licenses {
            for license in licenses {
                if license.contains('\'') {
                    return Err(Error::msg(
                        ErrorKind::InvalidQueryArg,
                        format!("license contains illegal character \"'\": {license}"),
                    ));
                }
            }
        }

        for system in &self.systems {
            if !is_supported_system(system) {
                return Err(Error::msg(
                    ErrorKind::InvalidQueryArg,
                    format!("unrecognized or unsupported system: {system}"),
                ));
            }
        }

        Ok(())
    }
}

/// Ranges for which the semver post-filter is a no-op.
const SEMVER_IGNORES: [&str; 7] = ["", "*", "any", "^*", "~*", "x", "X"];

/// A built query, ready for execution against an index.
pub struct PkgQuery {
    args: PkgQueryArgs,
    selects: Vec<String>,
    orders: Vec<String>,
    wheres: Vec<String>,
    binds: Vec<(&'static str, String)>,
    exported_columns: Vec<String>,
}

fn sql_in(column: &str, elems: &[String]) -> String {
    let quoted: Vec<String> = elems.iter().map(|elem| format!("'{elem}'")).collect();
    format!("{column} IN ( {} )", quoted.join(", "))
}

/// Nested `iif` assigning each element its position in `elems`, with the
/// list length as the fallthrough.
fn sql_rank(column: &str, elems: &[String], alias: &str) -> String {
    let mut rank = String::new();
    for (idx, elem) in elems.iter().enumerate() {
        rank.push_str(&format!("iif( ( {column} = '{elem}' ), {idx}, "));
    }
    rank.push_str(&elems.len().to_string());
    rank.push_str(&" )".repeat(elems.len()));
    format!("{rank} AS {alias}")
}

impl PkgQuery {
    pub fn new(args: PkgQueryArgs) -> Result<Self> {
        Self::with_exported_columns(args, vec!["id".to_string(), "semver".to_string()])
    }

    /// Build a query exporting a custom column list. Only intended for
    /// tests; columns other than `id` and `semver` may change freely.
    pub fn with_exported_columns(args: PkgQueryArgs, exported_columns: Vec<String>) -> Result<Self> {
        args.check()?;
        let mut query = PkgQuery {
            args,
            selects: Vec::new(),
            orders: Vec::new(),
            wheres: Vec::new(),
            binds: Vec::new(),
            exported_columns,
        };
        query.init();
        Ok(query)
    }

    fn add_selection(&mut self, column: impl Into<String>) {
        self.selects.push(column.into());
    }

    fn add_order_by(&mut self, order: impl Into<String>) {
        self.orders.push(order.into());
    }

    fn add_where(&mut self, cond: impl Into<String>) {
        self.wheres.push(format!("( {} )", cond.into()));
    }

    /// Handle exact and partial name matching filters and their
    /// ranking columns.
    fn init_match(&mut self) {
        match self.args.pname_or_attr_name.clone() {
            Some(pname_or_attr_name) if !pname_or_attr_name.is_empty() => {
                self.add_selection("( :pnameOrAttrName = pname ) AS exactPname");
                self.add_selection("( :pnameOrAttrName = attrName ) AS exactAttrName");
                self.binds.push((":pnameOrAttrName", pname_or_attr_name));
                self.add_where("( exactPname OR exactAttrName )");
            }
            _ => {
                // Constant placeholders so that `ORDER BY` works whether or
                // not the filter was active.
                self.add_selection("NULL AS exactPname");
                self.add_selection("NULL AS exactAttrName");
            }
        }

        let partial_name_match = self
            .args
            .partial_name_match
            .clone()
            .filter(|m| !m.is_empty());
        let partial_match = self.args.partial_match.clone().filter(|m| !m.is_empty());

        if partial_name_match.is_some() || partial_match.is_some() {
            // The bound value carries '%' wrappers for use with `LIKE`, so
            // the exact-match comparisons re-add them around the column.
            self.add_selection(
                "( ( '%' || LOWER( pname ) || '%' ) = LOWER( :partialMatch ) ) AS matchExactPname",
            );
            self.add_selection(
                "( ( '%' || LOWER( attrName ) || '%' ) = LOWER( :partialMatch ) ) \
                 AS matchExactAttrName",
            );
            self.add_selection("( pname LIKE :partialMatch ) AS matchPartialPname");
            self.add_selection("( attrName LIKE :partialMatch ) AS matchPartialAttrName");
            if let Some(needle) = partial_name_match {
                self.add_selection("NULL AS matchPartialDescription");
                self.binds.push((":partialMatch", format!("%{needle}%")));
                self.add_where(
                    "( matchExactPname OR matchExactAttrName OR \
                       matchPartialPname OR matchPartialAttrName )",
                );
            } else if let Some(needle) = partial_match {
                self.add_selection(
                    "( description LIKE :partialMatch ) AS matchPartialDescription",
                );
                self.binds.push((":partialMatch", format!("%{needle}%")));
                self.add_where(
                    "( matchExactPname OR matchExactAttrName OR \
                       matchPartialPname OR matchPartialAttrName OR \
                       matchPartialDescription )",
                );
            }
        } else {
            self.add_selection("NULL AS matchExactPname");
            self.add_selection("NULL AS matchExactAttrName");
            self.add_selection("NULL AS matchPartialPname");
            self.add_selection("NULL AS matchPartialAttrName");
            self.add_selection("NULL AS matchPartialDescription");
        }
    }

    fn init_subtrees(&mut self) {
        match self.args.subtrees.clone() {
            Some(subtrees) if !subtrees.is_empty() => {
                let names: Vec<String> = subtrees
                    .iter()
                    .map(|subtree| subtree.as_str().to_string())
                    .collect();
                self.add_where(sql_in("subtree", &names));
                if names.len() > 1 {
                    let rank = sql_rank("subtree", &names, "subtreesRank");
                    self.add_selection(rank);
                } else {
                    self.add_selection("0 AS subtreesRank");
                }
            }
            _ => {
                self.add_selection("0 AS subtreesRank");
            }
        }
    }

    fn init_systems(&mut self) {
        let systems = self.args.systems.clone();
        self.add_where(sql_in("system", &systems));
        if systems.len() > 1 {
            let rank = sql_rank("system", &systems, "systemsRank");
            self.add_selection(rank);
        } else {
            self.add_selection("0 AS systemsRank");
        }
    }

    fn init_order_by(&mut self) {
        self.add_order_by(
            "exactPname DESC\
           , matchExactPname DESC\
           , exactAttrName DESC\
           , matchExactAttrName DESC\
           , depth ASC\
           , matchPartialPname DESC\
           , matchPartialAttrName DESC\
           , matchPartialDescription DESC\
           , subtreesRank ASC\
           , systemsRank ASC\
           , pname ASC\
           , versionType ASC",
        );

        if self.args.prefer_pre_releases {
            self.add_order_by(
                "major DESC NULLS LAST\
               , minor DESC NULLS LAST\
               , patch DESC NULLS LAST\
               , preTag DESC NULLS FIRST",
            );
        } else {
            self.add_order_by(
                "preTag DESC NULLS FIRST\
               , major DESC NULLS LAST\
               , minor DESC NULLS LAST\
               , patch DESC NULLS LAST",
            );
        }

        // Lexicographic version as a fallback for misc. versions.
        self.add_order_by(
            "versionDate DESC NULLS LAST\
           , version ASC NULLS LAST\
           , brokenRank ASC\
           , unfreeRank ASC\
           , attrName ASC",
        );
    }

    fn init(&mut self) {
        self.add_selection("*");

        self.init_match();

        if let Some(name) = self.args.name.clone() {
            self.add_where("name = :name");
            self.binds.push((":name", name));
        }

        if let Some(pname) = self.args.pname.clone() {
            self.add_where("pname = :pname");
            self.binds.push((":pname", pname));
        }

        if let Some(version) = self.args.version.clone() {
            self.add_where("version = :version");
            self.binds.push((":version", version));
        } else if self.args.semver.is_some() {
            self.add_where("semver IS NOT NULL");
        }

        if let Some(licenses) = self.args.licenses.clone() {
            if !licenses.is_empty() {
                self.add_where("license IS NOT NULL");
                self.add_where(sql_in("license", &licenses));
            }
        }

        if !self.args.allow_broken {
            self.add_where("( broken IS NULL ) OR ( broken = FALSE )");
        }

        if !self.args.allow_unfree {
            self.add_where("( unfree IS NULL ) OR ( unfree = FALSE )");
        }

        if let Some(rel_path) = self.args.rel_path.clone() {
            self.add_where("relPath = :relPath");
            self.binds
                .push((":relPath", serde_json::json!(rel_path).to_string()));
        }

        self.init_subtrees();
        self.init_systems();
        self.init_order_by();
    }

    /// The unbound SQL statement.
    pub fn sql(&self) -> String {
        let mut sql = format!("SELECT {} FROM ( SELECT ", self.exported_columns.join(", "));
        sql.push_str(&self.selects.join(", "));
        sql.push_str(" FROM v_PackagesSearch");
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.orders.join(", "));
        }
        sql.push_str(" )");
        sql
    }

    /// Filter a set of version strings by the `semver` range.
    /// Unset or wildcard ranges pass everything through.
    fn filter_semvers(&self, versions: Vec<String>) -> Vec<String> {
        match &self.args.semver {
            None => versions,
            Some(range) if SEMVER_IGNORES.contains(&range.as_str()) => versions,
            Some(range) => versions::semver_sat(range, &versions),
        }
    }

    /// Run the query, returning an ordered list of satisfactory
    /// `Packages.id`s.
    pub fn execute(&self, db: &PkgDb) -> Result<Vec<RowId>> {
        let sql = self.sql();
        trace!(%sql, "executing package query");
        let mut stmt = db
            .connection()
            .prepare(&sql)
            .map_err(|err| Error::caught(ErrorKind::IndexError, "couldn't prepare query", err))?;
        let params: Vec<(&str, &dyn ToSql)> = self
            .binds
            .iter()
            .map(|(name, value)| (*name, value as &dyn ToSql))
            .collect();
        let mut rows = stmt
            .query(params.as_slice())
            .map_err(|err| Error::caught(ErrorKind::IndexError, "couldn't execute query", err))?;

        // Without a range filter the SQL result is already final.
        if self.args.semver.is_none() {
            let mut ids = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|err| Error::caught(ErrorKind::IndexError, "couldn't read row", err))?
            {
                ids.push(row.get(0).map_err(|err| {
                    Error::caught(ErrorKind::IndexError, "couldn't read row id", err)
                })?);
            }
            return Ok(ids);
        }

        // SQL handled filtering and ordering; the range is evaluated here
        // as a post-processing step over the unique version strings.
        let mut id_versions: Vec<(RowId, Option<String>)> = Vec::new();
        let mut unique_versions: Vec<String> = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| Error::caught(ErrorKind::IndexError, "couldn't read row", err))?
        {
            let id: RowId = row
                .get(0)
                .map_err(|err| Error::caught(ErrorKind::IndexError, "couldn't read row id", err))?;
            let version: Option<String> = row.get(1).map_err(|err| {
                Error::caught(ErrorKind::IndexError, "couldn't read row version", err)
            })?;
            if let Some(version) = &version {
                if !unique_versions.contains(version) {
                    unique_versions.push(version.clone());
                }
            }
            id_versions.push((id, version));
        }

        let satisfactory = self.filter_semvers(unique_versions);
        Ok(id_versions
            .into_iter()
            .filter(|(_, version)| {
                version
                    .as_ref()
                    .is_some_and(|version| satisfactory.contains(version))
            })
            .map(|(id, _)| id)
            .collect())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::read::db_path;
    use crate::test_util::{TestPackage, write_index};

    fn args() -> PkgQueryArgs {
        PkgQueryArgs {
            systems: vec!["x86_64-linux".to_string()],
            ..PkgQueryArgs::default()
        }
    }

    #[test]
    fn parses_from_json() {
        let args = PkgQueryArgs::from_value(&serde_json::json!({
            "pname": "hello",
            "semver": "^2.12",
            "systems": ["x86_64-linux"],
            "subtrees": ["legacyPackages"],
        }))
        .unwrap();
        assert_eq!(args.pname.as_deref(), Some("hello"));
        assert_eq!(args.subtrees, Some(vec![Subtree::LegacyPackages]));
        assert!(args.allow_unfree);

        let err = PkgQueryArgs::from_value(&serde_json::json!({ "pname": 7 })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseSearchQuery);
    }

    #[test]
    fn rejects_name_mixed_with_pname() {
        let query = PkgQuery::new(PkgQueryArgs {
            name: Some("hello-2.12".to_string()),
            pname: Some("hello".to_string()),
            ..args()
        });
        assert_eq!(query.err().unwrap().kind(), ErrorKind::InvalidQueryArg);
    }

    #[test]
    fn rejects_version_mixed_with_semver() {
        let query = PkgQuery::new(PkgQueryArgs {
            version: Some("2.12.1".to_string()),
            semver: Some("^2".to_string()),
            ..args()
        });
        assert_eq!(query.err().unwrap().kind(), ErrorKind::InvalidQueryArg);
    }

    #[test]
    fn rejects_conflicting_partial_matches() {
        let query = PkgQuery::new(PkgQueryArgs {
            partial_match: Some("hello".to_string()),
            partial_name_match: Some("hello".to_string()),
            ..args()
        });
        assert_eq!(query.err().unwrap().kind(), ErrorKind::InvalidQueryArg);
    }

    #[test]
    fn rejects_quoted_license_and_unknown_system() {
        let query = PkgQuery::new(PkgQueryArgs {
            licenses: Some(vec!["GPL'3".to_string()]),
            ..args()
        });
        assert_eq!(query.err().unwrap().kind(), ErrorKind::InvalidQueryArg);

        let query = PkgQuery::new(PkgQueryArgs {
            systems: vec!["riscv64-linux".to_string()],
            ..args()
        });
        assert_eq!(query.err().unwrap().kind(), ErrorKind::InvalidQueryArg);
    }

    fn version_index(dir: &std::path::Path) -> PkgDb {
        let fingerprint = write_index(
            dir,
            "github:example/snapshot/1111111111111111111111111111111111111111",
            serde_json::json!({ "type": "github", "owner": "example", "repo": "snapshot" }),
            &[
                TestPackage::new(&["legacyPackages", "x86_64-linux", "hello"], "hello", Some("2.13"))
                    .description("A program that produces a familiar, friendly greeting"),
                TestPackage::new(
                    &["legacyPackages", "x86_64-linux", "hello_2_12"],
                    "hello",
                    Some("2.12.0"),
                ),
                TestPackage::new(
                    &["legacyPackages", "x86_64-linux", "hello_2_12_1_pre"],
                    "hello",
                    Some("2.12.1-pre"),
                ),
                TestPackage::new(&["legacyPackages", "x86_64-linux", "figlet"], "figlet", Some("2.8")),
                TestPackage::new(
                    &["legacyPackages", "x86_64-linux", "broken-greeter"],
                    "broken-greeter",
                    Some("1.0.0"),
                )
                .broken(true),
                TestPackage::new(
                    &["legacyPackages", "x86_64-linux", "shady-greeter"],
                    "shady-greeter",
                    Some("1.0.0"),
                )
                .unfree(true)
                .license("Unfree"),
            ],
        )
        .unwrap();
        PkgDb::open(db_path(&fingerprint, dir)).unwrap()
    }

    fn versions_of(db: &PkgDb, ids: &[RowId]) -> Vec<String> {
        ids.iter()
            .map(|id| db.get_package(*id).unwrap().version.unwrap())
            .collect()
    }

    #[test]
    fn orders_releases_before_pre_releases_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());
        let ids = db
            .get_packages(&PkgQueryArgs {
                pname: Some("hello".to_string()),
                ..args()
            })
            .unwrap();
        assert_eq!(versions_of(&db, &ids), vec!["2.13", "2.12.0", "2.12.1-pre"]);
    }

    #[test]
    fn orders_pre_releases_first_when_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());
        let ids = db
            .get_packages(&PkgQueryArgs {
                pname: Some("hello".to_string()),
                prefer_pre_releases: true,
                ..args()
            })
            .unwrap();
        assert_eq!(versions_of(&db, &ids), vec!["2.13", "2.12.1-pre", "2.12.0"]);
    }

    #[test]
    fn filters_by_semver_range() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());
        let ids = db
            .get_packages(&PkgQueryArgs {
                pname: Some("hello".to_string()),
                semver: Some("~2.12.0".to_string()),
                ..args()
            })
            .unwrap();
        assert_eq!(versions_of(&db, &ids), vec!["2.12.0", "2.12.1-pre"]);
    }

    #[test]
    fn wildcard_ranges_skip_the_post_filter() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());
        let ids = db
            .get_packages(&PkgQueryArgs {
                pname: Some("hello".to_string()),
                semver: Some("*".to_string()),
                ..args()
            })
            .unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn matches_exact_pname_or_attr_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());
        let ids = db
            .get_packages(&PkgQueryArgs {
                pname_or_attr_name: Some("hello".to_string()),
                ..args()
            })
            .unwrap();
        assert_eq!(ids.len(), 3);
        // The row whose attribute name is exactly `hello` outranks the
        // rest of the pname matches.
        let top = db.get_package(ids[0]).unwrap();
        assert_eq!(top.rel_path, vec!["hello".to_string()]);
    }

    #[test]
    fn partial_match_reaches_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());
        let ids = db
            .get_packages(&PkgQueryArgs {
                partial_match: Some("friendly greeting".to_string()),
                ..args()
            })
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(db.get_package(ids[0]).unwrap().pname.as_deref(), Some("hello"));
    }

    #[test]
    fn broken_and_unfree_are_filtered_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());

        let broken = db
            .get_packages(&PkgQueryArgs {
                pname: Some("broken-greeter".to_string()),
                ..args()
            })
            .unwrap();
        assert_eq!(broken, Vec::<RowId>::new());

        let with_broken = db
            .get_packages(&PkgQueryArgs {
                pname: Some("broken-greeter".to_string()),
                allow_broken: true,
                ..args()
            })
            .unwrap();
        assert_eq!(with_broken.len(), 1);

        let unfree = db
            .get_packages(&PkgQueryArgs {
                pname: Some("shady-greeter".to_string()),
                allow_unfree: false,
                ..args()
            })
            .unwrap();
        assert_eq!(unfree, Vec::<RowId>::new());
    }

    #[test]
    fn filters_by_license_and_rel_path() {
        let dir = tempfile::tempdir().unwrap();
        let db = version_index(dir.path());

        let licensed = db
            .get_packages(&PkgQueryArgs {
                licenses: Some(vec!["Unfree".to_string()]),
                ..args()
            })
            .unwrap();
        assert_eq!(licensed.len(), 1);

        let by_path = db
            .get_packages(&PkgQueryArgs {
                rel_path: Some(vec!["figlet".to_string()]),
                ..args()
            })
            .unwrap();
        assert_eq!(by_path.len(), 1);
        assert_eq!(db.get_package(by_path[0]).unwrap().pname.as_deref(), Some("figlet"));
    }
}
