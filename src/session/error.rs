use crate::broker::BrokerError;
use crate::channel::ChannelId;
use crate::namespace::error::NamespaceError;

/// Errors that can occur when operating a channel session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was destroyed and accepts no further operations.
    #[error("session for channel '{channel}' has been destroyed")]
    Destroyed { channel: ChannelId },

    #[error("invalid topic: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A background publish or teardown task did not run to completion.
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
