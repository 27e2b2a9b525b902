//! Error types shared across the preinit crate.

use std::fmt;
use std::path::PathBuf;

pub type PreinitResult<T> = Result<T, PreinitError>;

#[derive(Debug, thiserror::Error)]
pub enum PreinitError {
    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("invalid HTTP method {0}")]
    InvalidMethod(String),

    #[error("request error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("request failed with status {0}")]
    Status(u16),

    #[error("unable to read response body: {0}")]
    BodyUnreadable(#[source] reqwest::Error),

    #[error("unable to decode spec: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("invalid spec: {0}")]
    Validation(String),

    #[error("unable to open {}: {source}", .path.display())]
    SysctlOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to write sysctl {key} with value {value}: {source}")]
    SysctlWrite {
        key: String,
        value: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service {name} failed to start: {source}")]
    ServiceStart {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {name} exited with {status}")]
    ServiceExit {
        name: String,
        status: std::process::ExitStatus,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Aggregate(#[from] MultiError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// A composite of independent failures from a concurrent batch.
///
/// Callers can enumerate the constituents via [`MultiError::errors`]
/// instead of parsing a concatenated message.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<PreinitError>,
}

impl MultiError {
    pub fn push(&mut self, err: PreinitError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[PreinitError] {
        &self.errors
    }

    /// Ok when no constituent failures were recorded.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
