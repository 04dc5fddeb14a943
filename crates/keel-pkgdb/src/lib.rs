//! Read side of the package index: a SQLite database caching the fully
//! enumerated package universe of one upstream snapshot, keyed by the
//! snapshot's fingerprint.
//!
//! Scraping an upstream tree into an index happens elsewhere; this crate
//! opens existing index files, answers attribute-path and package lookups,
//! and runs ranked package queries.

pub mod query;
pub mod read;
pub mod schema;
#[cfg(any(test, feature = "tests"))]
pub mod test_util;

pub use query::{PkgQuery, PkgQueryArgs};
pub use read::{LockedRef, PackageRow, PkgDb, RowId, cache_dir, db_path, ref_fingerprint};
pub use schema::{SQL_VERSIONS, SqlVersions};
