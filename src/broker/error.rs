use super::{ConsumerTag, DeliveryTag, QueueName};

/// Errors reported by a [`Broker`](super::Broker) for a single operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("exchange '{0}' does not exist")]
    ExchangeNotFound(String),

    #[error("queue '{0}' does not exist")]
    QueueNotFound(QueueName),

    /// The queue was declared exclusive by another connection.
    #[error("queue '{0}' is locked by another connection")]
    ExclusiveLocked(QueueName),

    #[error("consumer '{0}' does not exist")]
    ConsumerNotFound(ConsumerTag),

    #[error("queue '{queue}' is not bound to '{exchange}' with pattern '{pattern}'")]
    BindingNotFound {
        queue: QueueName,
        exchange: String,
        pattern: String,
    },

    #[error("delivery {tag} is not awaiting acknowledgment on queue '{queue}'")]
    UnknownDelivery { queue: QueueName, tag: DeliveryTag },

    #[error("broker connection closed")]
    ConnectionClosed,
}
