use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Everything that can stop a single page or record from making it into the
/// database. None of these abort a run; the pipeline counts them and moves on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("parse error in {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("missing required field `{0}`")]
    MissingRequiredField(&'static str),

    #[error("invalid format for `{field}`: {value:?}")]
    InvalidFormat { field: &'static str, value: String },

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database connection error: {0}")]
    Connection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ErrorKind {
    FetchError,
    ParseError,
    MissingRequiredField,
    InvalidFormat,
    ConstraintViolation,
    ConnectionError,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { .. } => ErrorKind::FetchError,
            Self::Parse { .. } => ErrorKind::ParseError,
            Self::MissingRequiredField(_) => ErrorKind::MissingRequiredField,
            Self::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            Self::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Self::Connection(_) => ErrorKind::ConnectionError,
        }
    }

    pub fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidFormat {
            field,
            value: value.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::FetchError => "FetchError",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::MissingRequiredField => "MissingRequiredField",
            ErrorKind::InvalidFormat => "InvalidFormat",
            ErrorKind::ConstraintViolation => "ConstraintViolation",
            ErrorKind::ConnectionError => "ConnectionError",
        };
        f.write_str(name)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(e.to_string())
            }
            _ => Self::Connection(e.to_string()),
        }
    }
}
