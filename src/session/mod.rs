//! Channel sessions: one client's view of the shared exchange.
//!
//! A [`ChannelSession`] owns a transient queue bound to `{downstream_prefix}.{channel}.#`,
//! dispatches everything arriving on it to a [`MessageHandler`], and publishes requests to
//! `{upstream_prefix}.{channel}.{command}`.
//!
//! Several sessions may exist for the same channel at once (e.g. a player with two browser
//! windows). Each gets its own queue and therefore its own copy of every downstream message.
//!
//! ```ignore
//! let session = ChannelSession::open(broker, SessionConfig::default(), "room42", |message: Message| async move {
//!     println!("{:?} -> {:?}", message.command(), message.payload);
//!     Ok(())
//! })
//! .await?;
//!
//! session.send("move", &json!({ "x": 1 }))?;
//!
//! session.destroy()?.wait().await?;
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod lifecycle;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, ConsumerTag, ContentType, DeliverySink, QueueName, QueueOptions};
use crate::channel::ChannelId;
use crate::dispatch::Dispatcher;
use crate::handler::MessageHandler;
use crate::payload;
use crate::state_machine::StateMachine;

pub use self::completion::Completion;
pub use self::config::SessionConfig;
pub use self::error::SessionError;
pub use self::lifecycle::LifecycleState;

use self::lifecycle::{LifecycleInput, LifecycleMachine, LifecycleOutput};

/// A live binding between a channel and a broker queue.
///
/// Created with [`open`](Self::open) and released with [`destroy`](Self::destroy). A session
/// dropped without being destroyed is torn down in the background.
pub struct ChannelSession {
    shared: Arc<SessionShared>,
}

/// State reachable from the background tasks of a session.
struct SessionShared {
    channel: ChannelId,
    broker: Arc<dyn Broker>,
    config: SessionConfig,
    queue: QueueName,
    binding_pattern: String,
    lifecycle: Mutex<LifecycleMachine>,
}

impl ChannelSession {
    /// Open a session for `channel`.
    ///
    /// Returns once the queue is declared and bound, so downstream messages published from now
    /// on are retained for this session. The consumer registration completes in the background;
    /// until then the session is [`LifecycleState::Initializing`], though deliveries may already
    /// reach `handler`.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn open<H: MessageHandler>(
        broker: Arc<dyn Broker>,
        config: SessionConfig,
        channel: impl Into<ChannelId>,
        handler: H,
    ) -> Result<Self, SessionError> {
        let channel = channel.into();
        let binding_pattern = config.namespace.downstream_binding_pattern(&channel)?;

        let queue = broker
            .declare_queue("", QueueOptions::builder().exclusive(config.exclusive).build())
            .await?;

        if let Err(e) = broker
            .bind_queue(&queue, &config.exchange, &binding_pattern)
            .await
        {
            warn!(
                channel = %channel,
                queue = %queue,
                error = %e,
                "Failed to bind session queue"
            );
            if let Err(delete_err) = broker.delete_queue(&queue).await {
                warn!(queue = %queue, error = %delete_err, "Failed to delete unbound session queue");
            }
            return Err(e.into());
        }

        let namespace = config.namespace.clone();
        let shared = Arc::new(SessionShared {
            channel,
            broker: Arc::clone(&broker),
            config,
            queue: queue.clone(),
            binding_pattern,
            lifecycle: Mutex::new(LifecycleMachine::new()),
        });

        let (sink, deliveries) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(broker, queue, Arc::new(handler));
        let gate = Arc::clone(&shared);
        tokio::spawn(dispatcher.run(
            deliveries,
            move |routing_key: &str| namespace.parse_response_route(routing_key),
            move || !gate.is_destroyed(),
        ));

        tokio::spawn(Arc::clone(&shared).subscribe(sink));

        info!(
            channel = %shared.channel,
            queue = %shared.queue,
            binding = %shared.binding_pattern,
            "Channel session opened"
        );

        Ok(Self { shared })
    }

    /// Publish `payload` as JSON to the channel's upstream `command` topic.
    ///
    /// The publish happens in the background. A failure is logged and surfaces only through
    /// the returned [`Completion`].
    pub fn send<T: Serialize + ?Sized>(
        &self,
        command: &str,
        payload: &T,
    ) -> Result<Completion, SessionError> {
        self.ensure_live()?;

        let topic = self
            .shared
            .config
            .namespace
            .upstream_topic(&self.shared.channel, command)?;
        let body = payload::encode(payload)?;

        Ok(publish_json(
            Arc::clone(&self.shared.broker),
            self.shared.config.exchange.clone(),
            topic,
            body,
        ))
    }

    /// [`send`](Self::send) with an empty JSON object.
    pub fn send_empty(&self, command: &str) -> Result<Completion, SessionError> {
        self.send(command, &serde_json::Map::new())
    }

    /// Stop dispatching and release the queue.
    ///
    /// Dispatch stops immediately. The consumer is then cancelled (if it was confirmed), the
    /// queue unbound and deleted, in that order, in the background. Teardown failures are
    /// logged and the first one is reported through the [`Completion`].
    ///
    /// Returns [`SessionError::Destroyed`] when called more than once.
    pub fn destroy(&self) -> Result<Completion, SessionError> {
        let outputs = {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.is_destroyed() {
                return Err(self.destroyed_error());
            }
            lifecycle.transition(LifecycleInput::Destroy)
        };

        debug!(
            channel = %self.shared.channel,
            queue = %self.shared.queue,
            "Destroying channel session"
        );

        let shared = Arc::clone(&self.shared);
        Ok(Completion::spawn(async move { shared.apply(outputs).await }))
    }

    pub fn channel(&self) -> &ChannelId {
        &self.shared.channel
    }

    pub fn queue(&self) -> &QueueName {
        &self.shared.queue
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// The confirmed consumer registration, if any.
    pub fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.shared.lifecycle().consumer_tag().cloned()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle().state().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), LifecycleState::Active(_))
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.shared.is_destroyed() {
            Err(self.destroyed_error())
        } else {
            Ok(())
        }
    }

    fn destroyed_error(&self) -> SessionError {
        SessionError::Destroyed {
            channel: self.shared.channel.clone(),
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if self.shared.is_destroyed() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                channel = %self.shared.channel,
                queue = %self.shared.queue,
                "Channel session dropped outside a runtime, leaving queue to the broker"
            );
            return;
        };

        let outputs = self.shared.lifecycle().transition(LifecycleInput::Destroy);
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            // Failures are logged by the teardown itself
            let _ = shared.apply(outputs).await;
        });
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("channel", &self.shared.channel)
            .field("queue", &self.shared.queue)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionShared {
    fn lifecycle(&self) -> MutexGuard<'_, LifecycleMachine> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_destroyed(&self) -> bool {
        self.lifecycle().is_destroyed()
    }

    /// Register the consumer and record its tag once the broker confirms it.
    async fn subscribe(self: Arc<Self>, sink: DeliverySink) {
        match self.broker.consume(&self.queue, sink).await {
            Ok(tag) => {
                debug!(
                    channel = %self.channel,
                    queue = %self.queue,
                    consumer = %tag,
                    "Consumer confirmed"
                );
                let outputs = self
                    .lifecycle()
                    .transition(LifecycleInput::ConsumerConfirmed(tag));
                // Failures are logged by apply
                let _ = self.apply(outputs).await;
            }
            Err(e) if self.is_destroyed() => {
                debug!(
                    channel = %self.channel,
                    queue = %self.queue,
                    error = %e,
                    "Consumer registration abandoned, session destroyed"
                );
            }
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    queue = %self.queue,
                    error = %e,
                    "Consumer registration failed"
                );
            }
        }
    }

    /// Perform the broker work requested by the lifecycle machine.
    async fn apply(&self, outputs: Vec<LifecycleOutput>) -> Result<(), BrokerError> {
        let mut first_error = None;

        for output in outputs {
            let result = match output {
                LifecycleOutput::Teardown { cancel } => self.teardown(cancel).await,
                LifecycleOutput::CancelOrphan(tag) => self.cancel_orphan(&tag).await,
            };
            if let Err(e) = result {
                first_error = first_error.or(Some(e));
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn teardown(&self, cancel: Option<ConsumerTag>) -> Result<(), BrokerError> {
        let mut first_error = None;

        if let Some(tag) = cancel {
            if let Err(e) = self.broker.cancel(&tag).await {
                warn!(
                    channel = %self.channel,
                    consumer = %tag,
                    error = %e,
                    "Failed to cancel consumer"
                );
                first_error = first_error.or(Some(e));
            }
        }

        if let Err(e) = self
            .broker
            .unbind_queue(&self.queue, &self.config.exchange, &self.binding_pattern)
            .await
        {
            warn!(
                channel = %self.channel,
                queue = %self.queue,
                error = %e,
                "Failed to unbind session queue"
            );
            first_error = first_error.or(Some(e));
        }

        if let Err(e) = self.broker.delete_queue(&self.queue).await {
            warn!(
                channel = %self.channel,
                queue = %self.queue,
                error = %e,
                "Failed to delete session queue"
            );
            first_error = first_error.or(Some(e));
        }

        info!(
            channel = %self.channel,
            queue = %self.queue,
            "Channel session destroyed"
        );

        first_error.map_or(Ok(()), Err)
    }

    async fn cancel_orphan(&self, tag: &ConsumerTag) -> Result<(), BrokerError> {
        let result = self.broker.cancel(tag).await;

        match &result {
            Ok(()) => {
                debug!(channel = %self.channel, consumer = %tag, "Orphaned consumer cancelled");
            }
            // The queue delete already took the consumer with it
            Err(BrokerError::ConsumerNotFound(_)) if self.is_destroyed() => return Ok(()),
            Err(e) => {
                warn!(
                    channel = %self.channel,
                    consumer = %tag,
                    error = %e,
                    "Failed to cancel orphaned consumer"
                );
            }
        }

        result
    }
}

/// Publish an encoded JSON body in the background.
pub(crate) fn publish_json(
    broker: Arc<dyn Broker>,
    exchange: String,
    topic: String,
    body: Bytes,
) -> Completion {
    Completion::spawn(async move {
        match broker
            .publish(&exchange, &topic, ContentType::Json, body.clone())
            .await
        {
            Ok(()) => {
                debug!(topic = %topic, body = %String::from_utf8_lossy(&body), "Sent");
                Ok(())
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Publish failed");
                Err(e)
            }
        }
    })
}
