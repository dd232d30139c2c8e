use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HavenError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection limit reached: {0}")]
    ConnectionLimit(String),
    #[error("invalid room: {0}")]
    InvalidRoom(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl HavenError {
    /// Whether the connection layer may recover from this error on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HavenError::Transport(_))
    }
}
