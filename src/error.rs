//! The pipeline's error taxonomy.
//!
//! Application plumbing uses [`anyhow`], but everything a caller might need to
//! act on is classified here. Input validation errors ([`OcrError::UnsupportedFormat`],
//! [`OcrError::PageLimitExceeded`]) and [`OcrError::NoRecognizableContent`] are
//! terminal outcomes of a run. Engine errors are absorbed per page and recorded
//! as [`PageFailure`] markers in the partial result.

use std::time::Duration;

use schemars::JsonSchema;
use thiserror::Error;

use crate::{prelude::*, retry::IsKnownTransient};

/// A `Result` carrying an [`OcrError`].
pub type OcrResult<T> = std::result::Result<T, OcrError>;

/// Machine-readable error kinds.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unrecognized or corrupt payload.
    UnsupportedFormat,
    /// Too many pages, or a page with too many pixels.
    PageLimitExceeded,
    /// The engine did not finish a page before its deadline.
    EngineTimeout,
    /// The engine terminated abnormally.
    EngineCrash,
    /// The engine finished, but found no text.
    EmptyResult,
    /// Every page of the document failed.
    NoRecognizableContent,
    /// The caller cancelled the run.
    Cancelled,
    /// Something went wrong in our own plumbing.
    Internal,
}

/// An error raised by the OCR pipeline.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("page limit exceeded: {0}")]
    PageLimitExceeded(String),

    #[error("recognition engine timed out after {0:?}")]
    EngineTimeout(Duration),

    #[error("recognition engine crashed: {0}")]
    EngineCrash(String),

    #[error("recognition engine produced no text")]
    EmptyResult,

    #[error("none of the document's pages could be recognized")]
    NoRecognizableContent,

    #[error("run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OcrError {
    /// Get the machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            OcrError::PageLimitExceeded(_) => ErrorKind::PageLimitExceeded,
            OcrError::EngineTimeout(_) => ErrorKind::EngineTimeout,
            OcrError::EngineCrash(_) => ErrorKind::EngineCrash,
            OcrError::EmptyResult => ErrorKind::EmptyResult,
            OcrError::NoRecognizableContent => ErrorKind::NoRecognizableContent,
            OcrError::Cancelled => ErrorKind::Cancelled,
            OcrError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Build a structured report of this error, suitable for output.
    pub fn to_report(&self) -> ErrorReport {
        let message = match self {
            // Include the whole `anyhow` context chain.
            OcrError::Internal(err) => format!("{err:#}"),
            other => other.to_string(),
        };
        ErrorReport {
            kind: self.kind(),
            message,
        }
    }
}

impl IsKnownTransient for OcrError {
    /// Only a crashed engine process is worth a second attempt. Timeouts on
    /// deterministic CPU-bound work will almost always time out again.
    fn is_known_transient(&self) -> bool {
        matches!(self, OcrError::EngineCrash(_))
    }
}

/// A structured error, with a kind and a human-readable message.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ErrorReport {
    /// What kind of error was this?
    pub kind: ErrorKind,

    /// A human-readable description.
    pub message: String,
}

/// Marker attached to a page that could not be recognized.
pub type PageFailure = ErrorReport;
