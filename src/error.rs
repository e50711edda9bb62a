//! Error taxonomy for the import pipeline
//!
//! Row- and chunk-scoped errors are recovered inside the pipeline; only
//! [`ImportError`] ever reaches the caller of [`crate::runner::run_import`].

use thiserror::Error;

/// A raw row could not be turned into an entity
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("row has {cells} cells but column '{column}' reads cell {index}")]
    MissingCell {
        column: String,
        index: usize,
        cells: usize,
    },

    #[error("value for non-nullable column '{column}' is empty")]
    NullNotAllowed { column: String },

    #[error("cannot cast '{value}' for non-nullable column '{column}': {reason}")]
    InvalidValue {
        column: String,
        value: String,
        reason: String,
    },
}

/// A single cell failed its type cast
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CastError(pub String);

/// A bulk statement was rejected by the storage engine
#[derive(Debug, Error)]
#[error("statement on table '{table}' failed: {message}")]
pub struct StatementError {
    pub table: String,
    pub message: String,
}

/// A byte buffer could not be decoded under the declared encoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode {encoding} bytes at offset {offset}")]
pub struct DecodeError {
    pub encoding: &'static str,
    pub offset: u64,
}

/// The model file describes an unusable schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaValidationError {
    #[error("primary key column '{0}' is not declared in the model")]
    UnknownPrimaryKeyColumn(String),

    #[error("primary key mode 'columns' requires at least one column")]
    EmptyPrimaryKey,

    #[error("model declares no columns")]
    NoColumns,

    #[error("column '{0}' is declared more than once")]
    DuplicateColumn(String),

    #[error("column '{0}' clashes with the generated primary key column")]
    ReservedColumn(String),
}

/// Three-way completion signal of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    InvalidInput,
    ExecutionFailure,
}

impl Outcome {
    /// Process exit code for this outcome
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::ExecutionFailure => 1,
            Outcome::InvalidInput => 2,
        }
    }
}

/// Run-level failure, classified for the CLI
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid input: {0:#}")]
    InvalidInput(anyhow::Error),

    #[error("execution failed: {0:#}")]
    Execution(anyhow::Error),
}

impl ImportError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ImportError::InvalidInput(_) => Outcome::InvalidInput,
            ImportError::Execution(_) => Outcome::ExecutionFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes_are_distinct() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::ExecutionFailure.exit_code(), 1);
        assert_eq!(Outcome::InvalidInput.exit_code(), 2);
    }

    #[test]
    fn test_import_error_classification() {
        let err = ImportError::InvalidInput(anyhow::anyhow!("bad model"));
        assert_eq!(err.outcome(), Outcome::InvalidInput);
        assert!(err.to_string().contains("bad model"));

        let err = ImportError::Execution(anyhow::anyhow!("connection refused"));
        assert_eq!(err.outcome(), Outcome::ExecutionFailure);
    }
}
