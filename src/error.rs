use thiserror::Error;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum Error {
    /// Connection to the remote container could not be established or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// A send or close was attempted on a link that is no longer open
    #[error("link closed: {0}")]
    LinkClosed(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message was missing a property this layer requires
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// The address URL could not be interpreted
    #[error("invalid address URL: {0}")]
    InvalidUrl(String),

    /// The reply side was torn down before a response arrived
    #[error("response channel closed before a reply arrived")]
    ResponseDropped,

    /// An opt-in call timeout expired
    #[error("request timed out")]
    Timeout,
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, Error>;
