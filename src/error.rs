use thiserror::Error;

/// Errors that can occur during gateway operations
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted with no live broker connection
    #[error("not connected to MQTT broker")]
    NotConnected,

    /// Transport rejected or could not establish the connection
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Broker rejected the protocol-level subscribe
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Broker rejected the protocol-level unsubscribe
    #[error("unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    /// Broker rejected the publish or the transport failed mid-send
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// JSON serialization of a structured payload failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// The variant's payload without its operation prefix.
    ///
    /// Used when an outcome fans out to waiters who rewrap it in the same
    /// variant, so the prefix is not rendered twice.
    pub(crate) fn detail(&self) -> String {
        // ---
        match self {
            Error::ConnectFailed(msg)
            | Error::SubscribeFailed(msg)
            | Error::UnsubscribeFailed(msg)
            | Error::PublishFailed(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;
