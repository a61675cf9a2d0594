//! Table Store Module
//!
//! Per-run embedded SQLite database used to pass step outputs by name.
//!
//! # Submodules
//!
//! - [`table`]: `TableStore`, `TableRef`, paged scans
//! - [`value`]: values, column types, schemas and batches
//! - [`batch`]: the `BatchSource` streaming trait

pub mod batch;
pub mod table;
pub mod value;

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::error::{ErrorCategory, StepError};

pub use batch::{BatchSource, VecSource};
pub use table::{quote_ident, StoreLocation, TableRef, TableScan, TableStore};
pub use value::{Batch, Column, ColumnType, Schema, Value};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table '{table}' does not exist")]
    MissingTable { table: String },

    #[error("Table '{table}' already exists")]
    AlreadyExists { table: String },

    #[error("Step '{step}' may not write to table '{table}' owned by '{owner}'")]
    NotOwner {
        table: String,
        owner: String,
        step: String,
    },

    #[error("Invalid table name '{0}'")]
    InvalidName(String),

    #[error("Not a single read-only SELECT: {0}")]
    InvalidQuery(String),

    #[error("Table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("Row for table '{table}' has {got} values, expected {expected}")]
    ColumnMismatch {
        table: String,
        expected: usize,
        got: usize,
    },

    #[error("Store already exists at {0}")]
    StoreExists(PathBuf),
}

impl StoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotOwner { .. } => ErrorCategory::Permission,
            Self::MissingTable { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidName(_)
            | Self::InvalidQuery(_)
            | Self::UnknownColumn { .. }
            | Self::ColumnMismatch { .. } => ErrorCategory::Validation,
            Self::Sqlite(err) => sqlite_category(err),
            Self::Io(_) | Self::StoreExists(_) => ErrorCategory::Unknown,
        }
    }
}

fn code_category(code: ErrorCode) -> ErrorCategory {
    match code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorCategory::Timeout,
        ErrorCode::PermissionDenied
        | ErrorCode::ReadOnly
        | ErrorCode::AuthorizationForStatementDenied => ErrorCategory::Permission,
        // SQLITE_ERROR: malformed SQL, unknown column or table
        ErrorCode::Unknown | ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch => {
            ErrorCategory::Validation
        }
        _ => ErrorCategory::Unknown,
    }
}

fn sqlite_category(err: &rusqlite::Error) -> ErrorCategory {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => code_category(failure.code),
        rusqlite::Error::SqlInputError { error, .. } => code_category(error.code),
        rusqlite::Error::MultipleStatement
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::InvalidParameterCount(_, _) => ErrorCategory::Validation,
        _ => ErrorCategory::Unknown,
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::new(err.category(), err.to_string())
    }
}
