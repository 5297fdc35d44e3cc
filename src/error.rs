use thiserror::Error;

/// Error types for `ciwatch` operations.
///
/// Covers configuration errors, provider API failures, git resolution
/// problems, and the cooperative signals used by the controller.
#[derive(Error, Debug)]
pub enum CiwatchError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("git reference was not found on remote server(s)")]
    UnknownGitReference,

    #[error("'{0}' is not a local git repository")]
    UnknownRepositoryUrl(String),

    #[error("URL '{0}' does not belong to a known pipeline")]
    UnknownUrl(String),

    #[error("Unknown git reference '{0}'")]
    UnknownRef(String),

    #[error("no log for this row")]
    NoLogHere,

    #[error("operation canceled")]
    Canceled,

    #[error("exit requested")]
    Exit,

    #[error("{provider} API returned status {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider} API error (status {status}) after {retries} retries")]
    ApiAfterRetries {
        provider: String,
        status: u16,
        retries: u32,
    },

    #[error("git: {0}")]
    Git(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CiwatchError {
    /// Errors the controller surfaces in the status line instead of
    /// terminating the event loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CiwatchError::UnknownGitReference
                | CiwatchError::UnknownRef(_)
                | CiwatchError::NoLogHere
                | CiwatchError::Canceled
                | CiwatchError::Api { .. }
                | CiwatchError::ApiAfterRetries { .. }
                | CiwatchError::Network(_)
        )
    }
}

/// Result type alias using `CiwatchError` as the error type.
pub type Result<T> = std::result::Result<T, CiwatchError>;
