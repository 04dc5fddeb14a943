//! Shared foundations for the keel resolution core: the error taxonomy,
//! system/subtree/attribute-path types, version analysis, and small
//! utilities used by both the package index and the resolver.

pub mod error;
pub mod types;
pub mod util;
pub mod versions;

pub use error::{Error, ErrorKind, Result};
