//! Error types for the collection pipeline.
//!
//! Every per-server failure is one of these and is handled at the scheduler
//! boundary; none of them abort a cycle on their own.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Malformed agent output. A decode call is all-or-nothing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found} (line {line})")]
    FieldCountMismatch {
        expected: usize,
        found: usize,
        line: usize,
    },

    #[error("field {field} is not a used/total ratio: {value:?}")]
    MalformedRatio { field: &'static str, value: String },

    #[error("field {field} is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field {field} is outside 0..=100: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

/// The remote agent could not produce output for one sub-collection.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not mark {program} executable: {source}")]
    Permissions {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// The store was unreachable or rejected a write.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open store {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to create schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("stored value {value} in column {column} is out of range")]
    Column { column: &'static str, value: i64 },
}

/// Invalid or incomplete configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} is set but {missing} is missing")]
    IncompleteTarget { key: String, missing: String },

    #[error("duplicate server name {name:?} ({first} and {second})")]
    DuplicateTarget {
        name: String,
        first: String,
        second: String,
    },

    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("failed to read {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenv::Error,
    },
}

/// Why one target produced no data this cycle.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("host is offline")]
    Offline,

    #[error("collection failed ({mode}): {source}")]
    Collection {
        mode: &'static str,
        #[source]
        source: CollectionError,
    },

    #[error("failed to decode {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: ParseError,
    },

    #[error("failed to store {what}: {source}")]
    Storage {
        what: &'static str,
        #[source]
        source: StorageError,
    },
}
