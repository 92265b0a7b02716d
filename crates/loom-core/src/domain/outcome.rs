//! Outcome of running a task body.
//!
//! A body returns `Result<Option<BlobId>, TaskError>`. `Ok` is success with an
//! optional result blob; `TaskError` carries the failure taxonomy:
//!
//! - `Broken`: deterministic, not performable without an external change.
//! - `Failed`: unexpected, transient or unknown; eligible for retry.
//! - `Deferred`: the body asked for a task that has not succeeded yet.

use serde::{Deserialize, Serialize};

use crate::ports::BlobError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("broken ({reason}): {message}")]
    Broken { reason: String, message: String },

    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    #[error("deferred until requirements succeed")]
    Deferred,
}

impl TaskError {
    pub fn broken(reason: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Broken {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::failed("io", e.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::failed("json", e.to_string())
    }
}

impl From<BlobError> for TaskError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(id) => TaskError::broken(
                super::task::reason::MISSING_BLOB,
                format!("blob {id} is not in the content store"),
            ),
            other => TaskError::failed("blob", other.to_string()),
        }
    }
}

/// A terminal failure as reported to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Failure {
    Broken {
        reason: String,
        message: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log: Option<String>,
    },
}

impl Failure {
    pub fn broken(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Failure::Broken {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, log: Option<String>) -> Self {
        Failure::Error {
            message: message.into(),
            log,
        }
    }

    /// Clamp message and log to the configured sizes.
    ///
    /// Messages keep their head (the error type is a prefix); logs keep their
    /// tail (the last lines are the interesting ones).
    pub fn truncated(self, max_message: usize, max_log: usize) -> Self {
        match self {
            Failure::Broken { reason, message } => Failure::Broken {
                reason,
                message: truncate_head(message, max_message),
            },
            Failure::Error { message, log } => Failure::Error {
                message: truncate_head(message, max_message),
                log: log.map(|l| truncate_tail(l, max_log)),
            },
        }
    }
}

fn truncate_head(mut s: String, max: usize) -> String {
    if s.chars().count() <= max {
        return s;
    }
    let cut = s.char_indices().nth(max).map(|(i, _)| i).unwrap_or(s.len());
    s.truncate(cut);
    s.push_str("...");
    s
}

fn truncate_tail(s: String, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    format!("...{}", &s[start..])
}

/// Error type of a stored error message: the text before the first `:`.
pub fn error_type(message: &str) -> &str {
    message.split(':').next().unwrap_or(message).trim()
}
