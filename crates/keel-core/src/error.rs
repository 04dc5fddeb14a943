//! A closed set of error categories used across the workspace.
//!
//! Every fallible boundary returns an [Error] carrying one of these
//! categories, an optional context string added where the error was raised,
//! and optionally the underlying error that was caught there. The rendered
//! message is `"<category>: <context>: <cause>"` with absent sections
//! omitted, and each category maps to a stable process exit code.

use serde_json::json;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed enumeration of error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An argument handed to the core is invalid.
    InvalidArg,
    /// A package descriptor in a manifest is invalid.
    InvalidManifestDescriptor,
    /// Package query parameters are invalid.
    InvalidQueryArg,
    /// A registry has invalid contents.
    InvalidRegistry,
    /// A manifest file is invalid.
    InvalidManifestFile,
    /// A lockfile is invalid.
    InvalidLockfile,
    /// A hash string is invalid.
    InvalidHash,
    /// One or more groups failed to resolve.
    ResolutionFailure,
    /// Generic package index failure.
    IndexError,
    /// The on-disk index schema does not match the compiled one.
    SchemaMismatch,
    /// The index file does not exist.
    NoSuchDatabase,
    /// Failed to parse a package descriptor.
    ParseDescriptor,
    /// Failed to parse a search query.
    ParseSearchQuery,
    /// Failed to convert TOML to JSON.
    TomlToJson,
    /// Failed to convert YAML to JSON.
    YamlToJson,
    /// An environment was assembled from inconsistent collaborators.
    EnvironmentMixin,
    /// A locked package failed validation against the manifest's rules.
    PackageCheckFailure,
    /// Failed to initialize a package from index data.
    PackageInit,
    /// Failed to evaluate an expression from an upstream snapshot.
    EvalError,
}

impl ErrorKind {
    /// Stable process exit code for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidArg => 101,
            ErrorKind::InvalidManifestDescriptor => 102,
            ErrorKind::InvalidQueryArg => 103,
            ErrorKind::InvalidRegistry => 104,
            ErrorKind::InvalidManifestFile => 105,
            ErrorKind::InvalidLockfile => 106,
            ErrorKind::InvalidHash => 107,
            ErrorKind::ResolutionFailure => 108,
            ErrorKind::IndexError => 109,
            ErrorKind::SchemaMismatch => 110,
            ErrorKind::NoSuchDatabase => 111,
            ErrorKind::ParseDescriptor => 112,
            ErrorKind::ParseSearchQuery => 113,
            ErrorKind::TomlToJson => 114,
            ErrorKind::YamlToJson => 115,
            ErrorKind::EnvironmentMixin => 116,
            ErrorKind::PackageCheckFailure => 117,
            ErrorKind::PackageInit => 118,
            ErrorKind::EvalError => 119,
        }
    }

    /// Static human readable category message.
    pub fn category_message(self) -> &'static str {
        match self {
            ErrorKind::InvalidArg => "invalid argument",
            ErrorKind::InvalidManifestDescriptor => "invalid manifest descriptor",
            ErrorKind::InvalidQueryArg => "invalid package query argument",
            ErrorKind::InvalidRegistry => "invalid registry",
            ErrorKind::InvalidManifestFile => "invalid manifest file",
            ErrorKind::InvalidLockfile => "invalid lockfile",
            ErrorKind::InvalidHash => "invalid hash",
            ErrorKind::ResolutionFailure => "resolution failure",
            ErrorKind::IndexError => "package index error",
            ErrorKind::SchemaMismatch => "package index schema mismatch",
            ErrorKind::NoSuchDatabase => "no such database",
            ErrorKind::ParseDescriptor => "error parsing descriptor",
            ErrorKind::ParseSearchQuery => "error parsing search query",
            ErrorKind::TomlToJson => "error converting TOML to JSON",
            ErrorKind::YamlToJson => "error converting YAML to JSON",
            ErrorKind::EnvironmentMixin => "invalid environment state",
            ErrorKind::PackageCheckFailure => "bad package",
            ErrorKind::PackageInit => "error initializing package",
            ErrorKind::EvalError => "evaluation error",
        }
    }
}

/// An error raised by the core.
///
/// Construct with [Error::new] for a bare category, [Error::msg] to attach
/// context, or [Error::caught] to additionally wrap an underlying error.
#[derive(Debug, thiserror::Error)]
#[error("{}", self.message())]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    #[source]
    caught: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            context: None,
            caught: None,
        }
    }

    pub fn msg(kind: ErrorKind, context: impl Into<String>) -> Self {
        Error {
            kind,
            context: Some(context.into()),
            caught: None,
        }
    }

    pub fn caught(
        kind: ErrorKind,
        context: impl Into<String>,
        caught: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error {
            kind,
            context: Some(context.into()),
            caught: Some(caught.into()),
        }
    }

    /// Prepend `prefix` to the context, keeping kind and cause.
    pub fn prefix_context(mut self, prefix: impl AsRef<str>) -> Self {
        self.context = Some(match self.context {
            Some(context) => format!("{}: {context}", prefix.as_ref()),
            None => prefix.as_ref().to_string(),
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn category_message(&self) -> &'static str {
        self.kind.category_message()
    }

    pub fn context_message(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn caught_message(&self) -> Option<String> {
        self.caught.as_ref().map(|err| err.to_string())
    }

    fn message(&self) -> String {
        let mut message = self.category_message().to_string();
        if let Some(context) = &self.context {
            message.push_str(": ");
            message.push_str(context);
        }
        if let Some(caught) = &self.caught {
            message.push_str(": ");
            message.push_str(&caught.to_string());
        }
        message
    }

    /// Machine readable projection emitted on non-terminal stdout.
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = json!({
            "exit_code": self.exit_code(),
            "category_message": self.category_message(),
        });
        if let Some(context) = self.context_message() {
            value["context_message"] = json!(context);
        }
        if let Some(caught) = self.caught_message() {
            value["caught_message"] = json!(caught);
        }
        value
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn message_sections_are_omitted_when_absent() {
        let bare = Error::new(ErrorKind::InvalidLockfile);
        assert_eq!(bare.to_string(), "invalid lockfile");

        let with_context = Error::msg(ErrorKind::InvalidLockfile, "no such path: ./missing");
        assert_eq!(
            with_context.to_string(),
            "invalid lockfile: no such path: ./missing"
        );

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let with_caught = Error::caught(ErrorKind::InvalidManifestFile, "couldn't read file", io);
        assert_eq!(
            with_caught.to_string(),
            "invalid manifest file: couldn't read file: not found"
        );
    }

    #[test]
    fn json_projection() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = Error::caught(ErrorKind::NoSuchDatabase, "/tmp/deadbeef.sqlite", io);
        assert_eq!(
            err.to_json(),
            serde_json::json!({
                "exit_code": 111,
                "category_message": "no such database",
                "context_message": "/tmp/deadbeef.sqlite",
                "caught_message": "not found",
            })
        );
    }

    #[test]
    fn exit_codes_are_unique() {
        let kinds = [
            ErrorKind::InvalidArg,
            ErrorKind::InvalidManifestDescriptor,
            ErrorKind::InvalidQueryArg,
            ErrorKind::InvalidRegistry,
            ErrorKind::InvalidManifestFile,
            ErrorKind::InvalidLockfile,
            ErrorKind::InvalidHash,
            ErrorKind::ResolutionFailure,
            ErrorKind::IndexError,
            ErrorKind::SchemaMismatch,
            ErrorKind::NoSuchDatabase,
            ErrorKind::ParseDescriptor,
            ErrorKind::ParseSearchQuery,
            ErrorKind::TomlToJson,
            ErrorKind::YamlToJson,
            ErrorKind::EnvironmentMixin,
            ErrorKind::PackageCheckFailure,
            ErrorKind::PackageInit,
            ErrorKind::EvalError,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|kind| kind.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
