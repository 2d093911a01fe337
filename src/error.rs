//! Error types for the PAC gateway.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Network failure or non-200 status while downloading the list.
    #[error("fetching {url} failed: {message}")]
    Fetch { url: String, message: String },

    /// The rule byte stream could not be read.
    #[error("parsing rule list failed: {0}")]
    Parse(#[source] io::Error),

    /// The downloaded body was not valid base64.
    #[error("decoding rule list failed: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Object store read/write/delete failure.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// PAC generation failure.
    #[error("rendering PAC failed: {0}")]
    Render(String),

    /// Hostname resolution failure.
    #[error("resolving {host} failed: {message}")]
    Dns { host: String, message: String },

    /// An outbound operation ran past its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An outbound operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn fetch(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Whether an updater cycle failing with this error can try again on the next tick.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Render(_))
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
