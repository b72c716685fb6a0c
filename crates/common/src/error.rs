//! Error types for the PVE gateway

use thiserror::Error;

/// Result type alias using the gateway Error
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("PVE API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Console session missing, expired or already redeemed")]
    SessionExpired,

    #[error("Console session does not match the requested virtual machine")]
    IdentityMismatch,

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the REST surface reports as a client-side 400 rather than a 5xx.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::Transport(_) | Error::Upstream { .. }
        )
    }
}
