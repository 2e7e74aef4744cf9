use thiserror::Error;

/// Errors produced by the burrow protocol layer.
#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unsupported message type: {0}")]
    UnknownType(String),

    #[error("malformed {0} payload: {1}")]
    MalformedPayload(String, String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("tunnel {0} is already registered")]
    DuplicateUrl(String),

    #[error("protocol {0} not supported yet")]
    UnsupportedProtocol(String),

    #[error("no proxy connection available")]
    NoProxyAvailable,

    #[error("proxy connection buffer is full")]
    ProxyBufferFull,

    #[error("heartbeat lost")]
    HeartbeatLoss,

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type BurrowResult<T> = Result<T, BurrowError>;
