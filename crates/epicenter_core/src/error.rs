use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for Epicenter storage-core operations.
///
/// Read paths generally do not fail (schema problems are reported as tagged
/// results, see [`crate::table::GetResult`]); this type covers write-path
/// validation, CRDT decode/apply failures, and extension lifecycle failures.
#[derive(Debug, Error)]
pub enum EpicenterError {
    /// A CRDT update could not be decoded or applied.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// A write was rejected because the value did not satisfy its schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A filesystem operation failed with a POSIX-style code.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// An extension factory or its readiness future failed.
    #[error("extension '{key}' failed: {message}")]
    Extension {
        /// Registry key of the failing extension
        key: String,
        /// Human-readable failure description
        message: String,
    },

    /// A content-doc provider factory or its readiness future failed.
    #[error("provider for content doc '{file_id}' failed: {message}")]
    Provider {
        /// File id of the content document being materialized
        file_id: String,
        /// Human-readable failure description
        message: String,
    },
}

/// Result type alias for Epicenter storage-core operations.
pub type Result<T> = std::result::Result<T, EpicenterError>;

/// A single schema violation, pointing at the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaError {
    /// Dotted path of the offending field (empty for whole-value errors)
    pub path: String,
    /// What went wrong
    pub message: String,
}

impl SchemaError {
    /// Create a schema error for a specific field path.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a schema error that applies to the value as a whole.
    pub fn root(message: impl Into<String>) -> Self {
        Self::new("", message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Raised when a write-path value fails schema validation.
///
/// Writes are strict: the offending value is rejected before any cell is
/// touched, so a failed `set` never partially commits.
#[derive(Debug, Clone, Error)]
#[error("validation failed for '{target}': {}", format_errors(.errors))]
pub struct ValidationError {
    /// Table or kv name the write was aimed at
    pub target: String,
    /// The individual field violations
    pub errors: Vec<SchemaError>,
}

impl ValidationError {
    /// Create a validation error for the named table/kv target.
    pub fn new(target: impl Into<String>, errors: Vec<SchemaError>) -> Self {
        Self {
            target: target.into(),
            errors,
        }
    }
}

fn format_errors(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// POSIX-style failure codes reported by the virtual filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum FsErrorCode {
    /// No such file or directory
    ENOENT,
    /// File or directory already exists
    EEXIST,
    /// Target is a directory
    EISDIR,
    /// A path component is not a directory
    ENOTDIR,
    /// Directory not empty
    ENOTEMPTY,
    /// Invalid argument (bad name, self-copy, root mutation)
    EINVAL,
    /// Operation not supported (symlinks, hardlinks)
    ENOSYS,
}

impl FsErrorCode {
    /// The canonical upper-case code string.
    pub fn as_str(&self) -> &'static str {
        match self {
            FsErrorCode::ENOENT => "ENOENT",
            FsErrorCode::EEXIST => "EEXIST",
            FsErrorCode::EISDIR => "EISDIR",
            FsErrorCode::ENOTDIR => "ENOTDIR",
            FsErrorCode::ENOTEMPTY => "ENOTEMPTY",
            FsErrorCode::EINVAL => "EINVAL",
            FsErrorCode::ENOSYS => "ENOSYS",
        }
    }
}

impl fmt::Display for FsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged filesystem failure: `{ code, path }`.
///
/// Every filesystem failure carries the POSIX-style code and the path the
/// operation was aimed at; consumers surface the code directly.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{code}: {path}")]
pub struct FsError {
    /// POSIX-style failure code
    pub code: FsErrorCode,
    /// The path the failing operation targeted
    pub path: String,
}

impl FsError {
    /// Create a tagged filesystem error.
    pub fn new(code: FsErrorCode, path: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
        }
    }
}
