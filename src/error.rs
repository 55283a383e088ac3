//! Error taxonomy for the parameter and process layers.
//!
//! Each error maps to a [`FailureKind`] so front ends can tell a broken case
//! directory apart from a bad user value or a crashing solver.

use crate::model::{ModuleType, ParameterCategory, TerminalId};
use std::path::PathBuf;
use thiserror::Error;

/// Broad class of failure, used to pick the remediation shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The project's files are missing or malformed.
    Configuration,
    /// A value supplied by the user was rejected.
    Input,
    /// The external solver or one of its tools misbehaved.
    Solver,
    /// The host environment (executables, permissions, I/O) is at fault.
    Environment,
}

impl FailureKind {
    pub fn remediation(self) -> &'static str {
        match self {
            FailureKind::Configuration => {
                "Check the project's case files; a dictionary is missing or not in the expected format."
            }
            FailureKind::Input => "Correct the highlighted value and try again.",
            FailureKind::Solver => {
                "The solver reported a failure; inspect its output for the numerical or model error."
            }
            FailureKind::Environment => {
                "Check that OpenFOAM is installed and sourced, and that the project directory is writable."
            }
        }
    }
}

/// Errors raised by a single-file codec.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("field `{field}` not found")]
    FieldNotFound { field: String },
    #[error("field `{field}` is ambiguous ({occurrences} occurrences)")]
    AmbiguousField { field: String, occurrences: usize },
    #[error("field `{field}` already present")]
    FieldExists { field: String },
    #[error("field `{field}` expects {expected}")]
    TypeMismatch { field: String, expected: &'static str },
    #[error("field `{field}` cannot be inserted, it is derived from other entries")]
    NotInsertable { field: String },
    #[error("field `{field}` cannot be updated: {reason}")]
    Degenerate { field: String, reason: String },
}

/// Errors raised by [`crate::params::ParameterManager`].
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("cannot parse {}: line {line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("field `{field}` not found in {}", path.display())]
    FieldNotFound { path: PathBuf, field: String },
    #[error("field `{field}` occurs {occurrences} times in {}, refusing to guess", path.display())]
    AmbiguousField {
        path: PathBuf,
        field: String,
        occurrences: usize,
    },
    #[error("field `{field}` already present in {}", path.display())]
    FieldExists { path: PathBuf, field: String },
    #[error("field `{field}` in {} cannot be updated: {reason}", path.display())]
    Degenerate {
        path: PathBuf,
        field: String,
        reason: String,
    },
    #[error("invalid value for `{field}`: {constraint}")]
    Validation { field: String, constraint: String },
    #[error("region `{region}` is not valid for {category} in a {module} project")]
    InvalidRegion {
        region: String,
        module: ModuleType,
        category: ParameterCategory,
    },
    #[error("parameter file not found: {}", path.display())]
    MissingFile { path: PathBuf },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ParamError {
    pub(crate) fn validation(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        ParamError::Validation {
            field: field.into(),
            constraint: constraint.into(),
        }
    }

    /// Attach the file a codec error came from.
    pub(crate) fn from_codec(path: PathBuf, err: CodecError) -> Self {
        match err {
            CodecError::Parse { line, message } => ParamError::Parse {
                path,
                line,
                message,
            },
            CodecError::FieldNotFound { field } => ParamError::FieldNotFound { path, field },
            CodecError::AmbiguousField { field, occurrences } => ParamError::AmbiguousField {
                path,
                field,
                occurrences,
            },
            CodecError::FieldExists { field } => ParamError::FieldExists { path, field },
            CodecError::TypeMismatch { field, expected } => {
                ParamError::validation(field, format!("expected {expected}"))
            }
            CodecError::NotInsertable { field } => {
                ParamError::validation(field, "derived field, edit it with a regular save")
            }
            CodecError::Degenerate { field, reason } => ParamError::Degenerate {
                path,
                field,
                reason,
            },
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ParamError::Validation { .. } | ParamError::InvalidRegion { .. } => FailureKind::Input,
            ParamError::Io { .. } => FailureKind::Environment,
            _ => FailureKind::Configuration,
        }
    }
}

/// Errors raised by the process layer.
///
/// A solver exiting with a non-zero code is not an error, it is reported as
/// [`crate::model::SessionState::Failed`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("terminal `{terminal}` is already running a process")]
    SessionBusy { terminal: TerminalId },
    #[error("terminal `{terminal}` has no running process")]
    NoActiveSession { terminal: TerminalId },
    #[error("failed to write to the process on terminal `{terminal}`: {source}")]
    Stdin {
        terminal: TerminalId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal the process on terminal `{terminal}`: {source}")]
    Signal {
        terminal: TerminalId,
        #[source]
        source: std::io::Error,
    },
    #[error("{operation} is not supported on this platform")]
    Unsupported { operation: &'static str },
}

impl ProcessError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProcessError::SessionBusy { .. } | ProcessError::NoActiveSession { .. } => {
                FailureKind::Input
            }
            ProcessError::Spawn { .. }
            | ProcessError::Stdin { .. }
            | ProcessError::Signal { .. }
            | ProcessError::Unsupported { .. } => FailureKind::Environment,
        }
    }
}

/// Errors raised while creating or opening a project.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("invalid project name `{name}`: only letters, digits and underscores are allowed")]
    InvalidName { name: String },
    #[error("a file or folder already exists at {}", path.display())]
    AlreadyExists { path: PathBuf },
    #[error("{} is not a battery-foam project: {reason}", path.display())]
    NotAProject { path: PathBuf, reason: String },
    #[error("template for {module} could not be materialized: {source}")]
    Template {
        module: ModuleType,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProjectError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProjectError::InvalidName { .. } | ProjectError::AlreadyExists { .. } => {
                FailureKind::Input
            }
            ProjectError::NotAProject { .. } | ProjectError::Template { .. } => {
                FailureKind::Configuration
            }
            ProjectError::Io { .. } => FailureKind::Environment,
        }
    }
}
