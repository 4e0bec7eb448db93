//! Server errors.

/// Failure starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Listener could not bind or accept.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Prometheus recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}
