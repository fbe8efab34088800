use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No healthy node available")]
    NoHealthyNode,

    #[error("Operation failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Provider offline: {0}")]
    ProviderOffline(String),

    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
