use std::future::Future;

use async_trait::async_trait;

use crate::channel::ChannelId;
use crate::namespace::Route;
use crate::payload::Payload;

/// An inbound message as seen by application code.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub route: Route,
    pub payload: Payload,
}

impl Message {
    /// The command segment of the routing key, `None` when the key was malformed.
    pub fn command(&self) -> Option<&str> {
        self.route.command()
    }

    pub fn channel(&self) -> Option<&ChannelId> {
        self.route.channel()
    }
}

/// Application callback invoked for every inbound message.
///
/// Errors and panics are caught by the caller, logged, and never prevent the message from being
/// acknowledged.
///
/// Implemented for any `Fn(Message) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}
