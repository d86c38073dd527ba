use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Socket connect, send or receive failure.
    #[error("connection error: {0}")]
    ConnectionError(String),
    /// Malformed frame, unknown message id, out-of-range index.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// A timeout in a phase where the peer is required to answer.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The peer has nothing we can use.
    #[error("peer error: {0}")]
    PeerError(String),
    /// Allocation or file I/O failure.
    #[error("resource error: {0}")]
    ResourceError(String),
    #[error("parser error: {0}")]
    ParserError(String),
    #[error("config error: {0}")]
    ConfigError(String),
}

impl ApplicationError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ApplicationError::ProtocolError(msg.into())
    }

    pub(crate) fn underrun(e: std::io::Error) -> Self {
        ApplicationError::ProtocolError(format!("buffer underrun: {}", e))
    }
}
