use crate::broker::BrokerError;

/// Reasons a single delivery was not processed cleanly.
///
/// These never leave the dispatch loop. They are logged and the loop moves on to the next
/// delivery.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The body was declared as JSON but did not parse. The delivery is rejected.
    #[error("failed to decode JSON body: {0}")]
    Decode(serde_json::Error),

    /// The handler returned an error. The delivery is still acknowledged.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// The handler panicked. The delivery is still acknowledged.
    #[error("handler panicked")]
    HandlerPanic,

    #[error("failed to acknowledge delivery: {0}")]
    Ack(#[from] BrokerError),
}
