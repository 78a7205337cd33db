//! Artifact client error types.

use thiserror::Error;

/// Errors fetching artifacts from a remote source.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Timeout or connection failure.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("remote error ({status}) for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ClientError::Unavailable(err.to_string())
        } else {
            ClientError::Transport(err)
        }
    }
}

/// Result type for artifact client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
