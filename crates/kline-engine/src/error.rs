use std::fmt;
use std::time::Duration;

use kline_providers::error::SourceError;
use thiserror::Error;

/// Job-level failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network failure, rate limit, timeout or server-side error. Retryable.
    Transient,
    /// Request-level failure such as an unknown symbol. Not retryable.
    Permanent,
    /// A page failed structural validation. Not retryable.
    Malformed,
    /// Every attempt failed transiently.
    ExhaustedRetries,
    /// The series was assembled but could not be written.
    PersistenceError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Malformed => "malformed",
            ErrorKind::ExhaustedRetries => "exhausted-retries",
            ErrorKind::PersistenceError => "persistence",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Server-requested minimum wait before the next attempt.
        retry_after: Option<Duration>,
    },

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("malformed page: {0}")]
    Malformed(String),

    #[error("gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries { attempts: u32, last: String },

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Transient { .. } => ErrorKind::Transient,
            JobError::Permanent(_) => ErrorKind::Permanent,
            JobError::Malformed(_) => ErrorKind::Malformed,
            JobError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            JobError::Persistence(_) => ErrorKind::PersistenceError,
        }
    }
}

impl From<SourceError> for JobError {
    fn from(err: SourceError) -> Self {
        let message = err.to_string();
        match err {
            SourceError::Http(e) if e.is_decode() => JobError::Malformed(message),
            SourceError::Http(e) => match e.status() {
                Some(status) if status.is_client_error() && status.as_u16() != 408 => {
                    JobError::Permanent(message)
                }
                _ => JobError::transient(message),
            },
            SourceError::RateLimited { retry_after_secs } => JobError::Transient {
                message,
                retry_after: Some(Duration::from_secs(retry_after_secs)),
            },
            SourceError::Api { status, .. } if status >= 500 || status == 408 => {
                JobError::transient(message)
            }
            SourceError::Api { .. } | SourceError::UnknownSymbol(_) | SourceError::Config(_) => {
                JobError::Permanent(message)
            }
            SourceError::Parse(_) => JobError::Malformed(message),
        }
    }
}
