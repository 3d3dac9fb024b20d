use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    #[error("root path does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("no search provider registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("{program} failed with code {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("unexpected search output: {0}")]
    Protocol(String),

    #[error("search was canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SearchError {
    /// True for the cancellation terminal, which is reported but not a fault.
    pub fn is_canceled(&self) -> bool {
        matches!(self, SearchError::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
