// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the ingestion pipeline.
//!
//! Per-line failures ([`ParseError`], [`SinkError::InvalidRecord`]) are recoverable: the
//! orchestrator logs them and moves on to the next line. Everything else surfaces as a
//! [`GestorError`] and ends the run.

use std::path::PathBuf;

/// A log line that could not be turned into a job event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("log line should have exactly four pieces separated by ';', found {found}: {line}")]
    FieldCount { found: usize, line: String },

    #[error("PBS job states are Q, S, E; not '{state}' as given for job {job_id}")]
    UnknownJobState { state: String, job_id: String },

    #[error("problem with 'resource=value' given as '{token}' for job {job_id}")]
    MalformedToken { token: String, job_id: String },
}

/// Failures raised while locating or reading accounting log files.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unable to read PBS configuration {path}: {reason}")]
    PbsConfig { path: PathBuf, reason: String },

    #[error("no accounting log files found in {0}")]
    NoLogs(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log reading cancelled")]
    Cancelled,
}

/// Errors returned by a [`crate::store::ReportingStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to provision table {table}: {source}")]
    Provisioning {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store connection is closed")]
    Disconnected,

    #[error("'{0}' is not a valid table or column name")]
    InvalidIdentifier(String),

    #[error("row is missing key column {0}")]
    MissingKey(String),
}

/// Errors raised by the checkpointed sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("connection to reporting database not available after {attempts} attempts")]
    Connection { attempts: u32 },

    #[error("record kind not configured: {0}")]
    Configuration(String),

    #[error("data is not a mapping, got {0}")]
    InvalidArgument(String),

    #[error("invalid record for job {job_id}: {reason}")]
    InvalidRecord { job_id: String, reason: String },

    #[error("stored checkpoint '{0}' is not a date")]
    CorruptCheckpoint(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SinkError {
    /// Whether the error only concerns the record being written and the run can go on.
    #[must_use]
    pub fn is_record_error(&self) -> bool {
        matches!(self, SinkError::InvalidRecord { .. })
    }
}

/// Invalid startup configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid date '{0}': expected 'today', 'lastscan', 'firstlog' or YYYYMMDD")]
    InvalidDate(String),
}

/// Fatal errors that end an ingestion run.
#[derive(Debug, thiserror::Error)]
pub enum GestorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("ingestion interrupted")]
    Cancelled,
}

impl From<SourceError> for GestorError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Cancelled => GestorError::Cancelled,
            other => GestorError::Source(other),
        }
    }
}

impl From<StoreError> for GestorError {
    fn from(err: StoreError) -> Self {
        GestorError::Sink(SinkError::Store(err))
    }
}
