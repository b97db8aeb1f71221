//! Error types for the locar library.
//!
//! All fallible operations in the crate return [`Result`] with this
//! module's [`Error`]. Load-time problems (malformed TSV, an
//! unsatisfiable constraint group) are fatal to the run; numeric
//! degeneracy inside least squares is tolerated and never surfaces here.

use thiserror::Error;

/// The main error type for the locar library.
#[derive(Error, Debug)]
pub enum Error {
    // ============ Parse Errors ============
    /// A TSV input could not be parsed.
    #[error("parse error in {path} (line {line}): {message}")]
    Parse {
        /// File the error occurred in.
        path: String,
        /// 1-based line number.
        line: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// The locating-array file declares a version this software does not read.
    #[error("locating array version must be {expected}, found {found}")]
    UnsupportedVersion {
        /// Version string this software reads.
        expected: &'static str,
        /// Version string found in the file.
        found: String,
    },

    // ============ Constraint Errors ============
    /// A constraint group admits no satisfying level combination.
    #[error("constraint group {group} has no satisfying level combination")]
    ConstraintUnsatisfiable {
        /// Index of the offending group in the locating array.
        group: usize,
    },

    // ============ Dimension Errors ============
    /// Two sizes that must agree do not.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension description.
        expected: String,
        /// Actual dimension description.
        actual: String,
    },

    /// A response file declares a row count different from the locating array.
    #[error("row mismatch in {path}: expected {expected} rows, found {found}")]
    RowMismatch {
        /// Response file the mismatch occurred in.
        path: String,
        /// Rows in the locating array.
        expected: usize,
        /// Rows declared by the response file.
        found: usize,
    },

    /// No response file carries the requested column.
    #[error("response column {column:?} not found in any file under {dir}")]
    ColumnNotFound {
        /// The requested column name.
        column: String,
        /// The directory that was searched.
        dir: String,
    },

    // ============ Parameter Errors ============
    /// An operation was invoked with invalid parameters.
    #[error("invalid parameters: {message}")]
    InvalidParams {
        /// Description of what is invalid.
        message: String,
    },

    // ============ I/O ============
    /// An underlying I/O operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized `Result` type for locar operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Create a new `Parse` error.
    #[must_use]
    pub fn parse(path: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Create a new `InvalidParams` error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Create a new `DimensionMismatch` error.
    #[must_use]
    pub fn dimension(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
