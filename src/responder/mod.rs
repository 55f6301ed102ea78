//! The backend side of the channel namespaces.
//!
//! A [`Responder`] consumes requests published by every channel session and publishes replies
//! into one channel's downstream namespace.
//!
//! ```ignore
//! let responder = Responder::new(broker, SessionConfig::default());
//!
//! let replies = responder.clone();
//! let listener = responder
//!     .listen("game-requests", move |message: Message| {
//!         let replies = replies.clone();
//!         async move {
//!             if let (Some(channel), Some("join")) = (message.channel(), message.command()) {
//!                 replies.reply(channel, "joined", &json!({ "ok": true }))?;
//!             }
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError, ConsumerTag, QueueName, QueueOptions};
use crate::channel::ChannelId;
use crate::dispatch::Dispatcher;
use crate::handler::MessageHandler;
use crate::payload;
use crate::session::{Completion, SessionConfig, SessionError, publish_json};

/// Publishes replies to channels and listens for their requests.
#[derive(Clone)]
pub struct Responder {
    broker: Arc<dyn Broker>,
    config: SessionConfig,
}

impl Responder {
    pub fn new(broker: Arc<dyn Broker>, config: SessionConfig) -> Self {
        Self { broker, config }
    }

    /// Publish `payload` as JSON to `{downstream_prefix}.{channel}.{command}`.
    ///
    /// Every session open for `channel` receives it.
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        channel: &ChannelId,
        command: &str,
        payload: &T,
    ) -> Result<Completion, SessionError> {
        let topic = self.config.namespace.downstream_topic(channel, command)?;
        let body = payload::encode(payload)?;

        Ok(publish_json(
            Arc::clone(&self.broker),
            self.config.exchange.clone(),
            topic,
            body,
        ))
    }

    /// Consume requests of every channel from the shared queue `queue_name`.
    ///
    /// The queue is declared non-exclusive, so several backend instances listening on the same
    /// name share the load: each request goes to one of them. Handlers receive routes parsed in
    /// the upstream namespace.
    ///
    /// On failure, a queue created by this call is unbound and deleted again. A queue that
    /// already existed is left alone.
    pub async fn listen<H: MessageHandler>(
        &self,
        queue_name: &str,
        handler: H,
    ) -> Result<Listener, SessionError> {
        let pattern = self.config.namespace.upstream_binding_pattern();

        let existed = self
            .broker
            .declare_queue(queue_name, QueueOptions::builder().passive(true).build())
            .await
            .is_ok();
        let queue = self
            .broker
            .declare_queue(queue_name, QueueOptions::default())
            .await?;

        if let Err(e) = self
            .broker
            .bind_queue(&queue, &self.config.exchange, &pattern)
            .await
        {
            warn!(queue = %queue, binding = %pattern, error = %e, "Failed to bind request queue");
            if !existed {
                self.discard_queue(&queue, None).await;
            }
            return Err(e.into());
        }

        let (sink, deliveries) = mpsc::unbounded_channel();
        let consumer = match self.broker.consume(&queue, sink).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to consume request queue");
                if !existed {
                    self.discard_queue(&queue, Some(&pattern)).await;
                }
                return Err(e.into());
            }
        };

        let namespace = self.config.namespace.clone();
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.broker),
            queue.clone(),
            Arc::new(handler),
        );
        tokio::spawn(dispatcher.run(
            deliveries,
            move |routing_key: &str| namespace.parse_request_route(routing_key),
            || true,
        ));

        info!(queue = %queue, binding = %pattern, consumer = %consumer, "Listening for requests");

        Ok(Listener {
            broker: Arc::clone(&self.broker),
            exchange: self.config.exchange.clone(),
            queue,
            pattern,
            consumer,
        })
    }

    /// Undo a half-finished [`listen`](Self::listen) on a queue it created.
    async fn discard_queue(&self, queue: &QueueName, pattern: Option<&str>) {
        if let Some(pattern) = pattern {
            if let Err(e) = self
                .broker
                .unbind_queue(queue, &self.config.exchange, pattern)
                .await
            {
                warn!(queue = %queue, binding = %pattern, error = %e, "Failed to unbind request queue");
            }
        }

        if let Err(e) = self.broker.delete_queue(queue).await {
            warn!(queue = %queue, error = %e, "Failed to delete request queue");
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// A running request consumer started by [`Responder::listen`].
pub struct Listener {
    broker: Arc<dyn Broker>,
    exchange: String,
    queue: QueueName,
    pattern: String,
    consumer: ConsumerTag,
}

impl Listener {
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Cancel this instance's consumer. The queue stays bound, so instances still listening on
    /// it keep receiving requests and new ones accumulate for the next listener.
    pub async fn stop(self) -> Result<(), BrokerError> {
        self.cancel().await
    }

    /// Cancel the consumer and unbind the queue, for the last instance going away. The queue
    /// itself is kept.
    pub async fn close(self) -> Result<(), BrokerError> {
        let cancelled = self.cancel().await;

        let unbound = self
            .broker
            .unbind_queue(&self.queue, &self.exchange, &self.pattern)
            .await;
        if let Err(e) = &unbound {
            warn!(queue = %self.queue, error = %e, "Failed to unbind listener queue");
        }

        cancelled.and(unbound)
    }

    async fn cancel(&self) -> Result<(), BrokerError> {
        let cancelled = self.broker.cancel(&self.consumer).await;
        match &cancelled {
            Ok(()) => info!(queue = %self.queue, consumer = %self.consumer, "Stopped listening for requests"),
            Err(e) => warn!(
                queue = %self.queue,
                consumer = %self.consumer,
                error = %e,
                "Failed to cancel listener"
            ),
        }
        cancelled
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("queue", &self.queue)
            .field("pattern", &self.pattern)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use tokio::time::timeout;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::broker::{ContentType, DeliverySink, DeliveryTag, MemoryBroker, MemoryConnection};
    use crate::handler::Message;
    use crate::payload::Payload;
    use crate::session::ChannelSession;

    const EXCHANGE: &str = "socket";

    #[derive(Debug, Deserialize, PartialEq)]
    struct Move {
        x: i64,
    }

    /// Replies to every request with `{command}-ack`, echoing the payload.
    async fn echo_backend(broker: &MemoryBroker) -> (Responder, Listener) {
        let responder = Responder::new(Arc::new(broker.connect()), SessionConfig::default());

        let replies = responder.clone();
        let listener = responder
            .listen("backend", move |message: Message| {
                let replies = replies.clone();
                async move {
                    let channel = message
                        .channel()
                        .ok_or_else(|| anyhow::anyhow!("request without channel"))?;
                    let command = message.command().unwrap_or_default();
                    let payload = message.payload.as_json().cloned().unwrap_or_default();

                    replies.reply(channel, &format!("{command}-ack"), &payload)?;
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();

        (responder, listener)
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let broker = MemoryBroker::new().with_exchange(EXCHANGE);
        let (_responder, _listener) = echo_backend(&broker).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ChannelSession::open(
            Arc::new(broker.connect()),
            SessionConfig::default(),
            "c1",
            move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    anyhow::Ok(())
                }
            },
        )
        .await
        .unwrap();

        session.send("move", &json!({ "x": 1 })).unwrap();

        let response = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.command(), Some("move-ack"));
        assert_eq!(response.channel(), Some(&ChannelId::from("c1")));
        assert_eq!(response.payload.deserialize::<Move>().unwrap(), Move { x: 1 });
    }

    #[tokio::test]
    async fn test_reply_reaches_only_target_channel() {
        let broker = MemoryBroker::new().with_exchange(EXCHANGE);
        let responder = Responder::new(Arc::new(broker.connect()), SessionConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _other = ChannelSession::open(
            Arc::new(broker.connect()),
            SessionConfig::default(),
            "c2",
            move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    anyhow::Ok(())
                }
            },
        )
        .await
        .unwrap();

        responder
            .reply(&ChannelId::from("c1"), "joined", &json!({}))
            .unwrap()
            .wait()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_parses_request_routes() {
        let broker = MemoryBroker::new().with_exchange(EXCHANGE);
        let responder = Responder::new(Arc::new(broker.connect()), SessionConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = responder
            .listen("backend", move |message: Message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();

        let client = broker.connect();
        client
            .publish(
                EXCHANGE,
                "upstream.p7.attack.left",
                ContentType::Json,
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap();

        let request = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.channel(), Some(&ChannelId::from("p7")));
        assert_eq!(request.command(), Some("attack"));
        assert_eq!(request.payload, Payload::Json(json!({})));

        let queue = listener.queue().clone();
        listener.close().await.unwrap();
        assert_eq!(broker.binding_count(&queue), 0);
        assert!(!broker.has_consumer(&queue));
        assert!(broker.queue_exists(&queue));
    }

    fn tagged(
        instance: &'static str,
        tx: mpsc::UnboundedSender<(&'static str, Message)>,
    ) -> impl MessageHandler {
        move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((instance, message));
                anyhow::Ok(())
            }
        }
    }

    async fn request(broker: &MemoryBroker, routing_key: &str) {
        broker
            .connect()
            .publish(
                EXCHANGE,
                routing_key,
                ContentType::Json,
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_backend_instances_share_request_queue() {
        let broker = MemoryBroker::new().with_exchange(EXCHANGE);
        let a = Responder::new(Arc::new(broker.connect()), SessionConfig::default());
        let b = Responder::new(Arc::new(broker.connect()), SessionConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener_a = a.listen("backend", tagged("a", tx.clone())).await.unwrap();
        let _listener_b = b.listen("backend", tagged("b", tx)).await.unwrap();
        assert_eq!(broker.consumer_count(listener_a.queue()), 2);
        assert_eq!(broker.binding_count(listener_a.queue()), 1);

        request(&broker, "upstream.p1.move").await;
        request(&broker, "upstream.p2.move").await;

        let mut served = Vec::new();
        for _ in 0..2 {
            let (instance, _) = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            served.push(instance);
        }
        served.sort();
        assert_eq!(served, ["a", "b"]);

        // Stopping one instance leaves the queue bound for the other
        let queue = listener_a.queue().clone();
        listener_a.stop().await.unwrap();
        assert_eq!(broker.binding_count(&queue), 1);

        request(&broker, "upstream.p3.move").await;
        let (instance, message) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance, "b");
        assert_eq!(message.channel(), Some(&ChannelId::from("p3")));
    }

    #[tokio::test]
    async fn test_listen_bind_failure_removes_created_queue() {
        let broker = MemoryBroker::new();
        let responder = Responder::new(Arc::new(broker.connect()), SessionConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = responder.listen("backend", tagged("a", tx)).await;

        assert!(matches!(
            result,
            Err(SessionError::Broker(BrokerError::ExchangeNotFound(_)))
        ));
        assert_eq!(broker.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_listen_bind_failure_keeps_existing_queue() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let queue = owner
            .declare_queue("backend", QueueOptions::default())
            .await
            .unwrap();

        let responder = Responder::new(Arc::new(broker.connect()), SessionConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = responder.listen("backend", tagged("a", tx)).await;

        assert!(result.is_err());
        assert!(broker.queue_exists(&queue));
    }

    /// Refuses every consumer registration.
    struct NoConsumers {
        inner: MemoryConnection,
    }

    #[async_trait]
    impl Broker for NoConsumers {
        async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<QueueName, BrokerError> {
            self.inner.declare_queue(name, options).await
        }

        async fn bind_queue(&self, queue: &QueueName, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
            self.inner.bind_queue(queue, exchange, pattern).await
        }

        async fn unbind_queue(&self, queue: &QueueName, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
            self.inner.unbind_queue(queue, exchange, pattern).await
        }

        async fn delete_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
            self.inner.delete_queue(queue).await
        }

        async fn consume(&self, queue: &QueueName, _sink: DeliverySink) -> Result<ConsumerTag, BrokerError> {
            Err(BrokerError::QueueNotFound(queue.clone()))
        }

        async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), BrokerError> {
            self.inner.cancel(consumer).await
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            content_type: ContentType,
            body: Bytes,
        ) -> Result<(), BrokerError> {
            self.inner.publish(exchange, routing_key, content_type, body).await
        }

        async fn ack(&self, queue: &QueueName, delivery: DeliveryTag) -> Result<(), BrokerError> {
            self.inner.ack(queue, delivery).await
        }

        async fn reject(&self, queue: &QueueName, delivery: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
            self.inner.reject(queue, delivery, requeue).await
        }
    }

    #[tokio::test]
    async fn test_listen_consume_failure_unbinds_and_removes_created_queue() {
        let broker = MemoryBroker::new().with_exchange(EXCHANGE);
        let conn = Arc::new(NoConsumers {
            inner: broker.connect(),
        });
        let responder = Responder::new(conn, SessionConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = responder.listen("backend", tagged("a", tx)).await;

        assert!(matches!(
            result,
            Err(SessionError::Broker(BrokerError::QueueNotFound(_)))
        ));
        assert_eq!(broker.queue_count(), 0);
    }
}
