// Typed errors surfaced across the fabric

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("engine timeout: {0}")]
    Timeout(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("malformed log frame: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map a bollard error into one of our kinds.
    pub fn from_bollard(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match err {
            B::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            B::IOError { err } => EngineError::Unavailable(err.to_string()),
            B::RequestTimeoutError => EngineError::Timeout("engine request timed out".into()),
            other => EngineError::Internal(other.to_string()),
        }
    }

    /// Timeout produced by a deadline combinator around an engine call.
    pub fn deadline(what: &str) -> Self {
        EngineError::Timeout(format!("{what} deadline exceeded"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
