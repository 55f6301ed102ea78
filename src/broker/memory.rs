use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet, Entry};
use tokio::sync::mpsc::error::SendError;
use tracing::{debug, trace};
use uuid::Uuid;

use super::topic;
use super::{
    Broker, BrokerError, ConsumerTag, ContentType, Delivery, DeliverySink, DeliveryTag,
    QueueName, QueueOptions,
};

/// An in-process topic-exchange broker.
///
/// Cloning a [`MemoryBroker`] yields another handle to the same broker. Clients talk to it
/// through a [`MemoryConnection`], which owns the exclusive queues it declares.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: DashSet<String, ahash::RandomState>,
    queues: DashMap<QueueName, QueueState, ahash::RandomState>,
    consumers: DashMap<ConsumerTag, QueueName, ahash::RandomState>,
    next_delivery_tag: AtomicU64,
    next_connection_id: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
}

#[derive(Debug)]
struct Consumer {
    tag: ConsumerTag,
    sink: DeliverySink,
}

#[derive(Debug)]
struct QueueState {
    /// Set for exclusive queues.
    owner: Option<ConnectionId>,
    bindings: Vec<Binding>,
    /// Served in turn, starting at `next_consumer`.
    consumers: Vec<Consumer>,
    next_consumer: usize,
    ready: VecDeque<Delivery>,
    unacked: HashMap<DeliveryTag, Delivery>,
}

impl QueueState {
    fn new(owner: Option<ConnectionId>) -> Self {
        Self {
            owner,
            bindings: Vec::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }

    fn is_bound(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.exchange == exchange && topic::matches(&b.pattern, routing_key))
    }

    fn enqueue(&mut self, delivery: Delivery) {
        self.ready.push_back(delivery);
        self.flush();
    }

    /// Hand ready messages to the consumers round-robin. A consumer whose receiver is gone is
    /// dropped and its message goes to the next one.
    fn flush(&mut self) {
        while !self.consumers.is_empty() {
            let Some(delivery) = self.ready.pop_front() else {
                break;
            };

            let index = self.next_consumer % self.consumers.len();
            self.unacked.insert(delivery.delivery_tag, delivery.clone());

            match self.consumers[index].sink.send(delivery) {
                Ok(()) => self.next_consumer = index + 1,
                Err(SendError(delivery)) => {
                    let consumer = self.consumers.remove(index);
                    trace!(consumer = %consumer.tag, "consumer receiver dropped");
                    self.unacked.remove(&delivery.delivery_tag);
                    self.ready.push_front(delivery);
                    self.next_consumer = index;
                }
            }
        }
    }
}

impl BrokerState {
    fn ensure_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        if self.exchanges.contains(exchange) {
            Ok(())
        } else {
            Err(BrokerError::ExchangeNotFound(exchange.to_string()))
        }
    }

    fn remove_queue(&self, queue: &QueueName) -> Option<QueueState> {
        let (_, state) = self.queues.remove(queue)?;
        for consumer in &state.consumers {
            self.consumers.remove(&consumer.tag);
        }
        Some(state)
    }

    fn next_delivery_tag(&self) -> DeliveryTag {
        DeliveryTag::new(self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `exchange` and return the broker, for chained construction.
    pub fn with_exchange(self, exchange: impl Into<String>) -> Self {
        self.declare_exchange(exchange);
        self
    }

    pub fn declare_exchange(&self, exchange: impl Into<String>) {
        self.state.exchanges.insert(exchange.into());
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        MemoryConnection {
            id: ConnectionId(id),
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        self.state.queues.contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        self.state.queues.len()
    }

    pub fn binding_count(&self, queue: &QueueName) -> usize {
        self.view_queue(queue, |q| q.bindings.len())
    }

    pub fn has_consumer(&self, queue: &QueueName) -> bool {
        self.consumer_count(queue) > 0
    }

    pub fn consumer_count(&self, queue: &QueueName) -> usize {
        self.view_queue(queue, |q| q.consumers.len())
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &QueueName) -> usize {
        self.view_queue(queue, |q| q.ready.len())
    }

    /// Messages handed to a consumer and not yet acknowledged or rejected.
    pub fn unacked_count(&self, queue: &QueueName) -> usize {
        self.view_queue(queue, |q| q.unacked.len())
    }

    fn view_queue<R: Default>(&self, queue: &QueueName, view_fn: impl FnOnce(&QueueState) -> R) -> R {
        self.state
            .queues
            .view(queue, |_, state| view_fn(state))
            .unwrap_or_default()
    }
}

/// A client connection to a [`MemoryBroker`].
///
/// Closing or dropping the connection deletes every exclusive queue it declared.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let owned: Vec<QueueName> = self
            .broker
            .state
            .queues
            .iter()
            .filter(|entry| entry.owner == Some(self.id))
            .map(|entry| entry.key().clone())
            .collect();

        for queue in &owned {
            self.broker.state.remove_queue(queue);
        }

        debug!(
            connection = self.id.0,
            deleted_queues = owned.len(),
            "Connection closed"
        );
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn check_access(&self, queue: &QueueName, state: &QueueState) -> Result<(), BrokerError> {
        if state.owner.is_some_and(|owner| owner != self.id) {
            return Err(BrokerError::ExclusiveLocked(queue.clone()));
        }
        Ok(())
    }

    /// Run `f` against a queue this connection may use.
    fn with_queue<R>(
        &self,
        queue: &QueueName,
        f: impl FnOnce(&mut QueueState) -> Result<R, BrokerError>,
    ) -> Result<R, BrokerError> {
        self.ensure_open()?;

        let mut state = self
            .broker
            .state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.clone()))?;
        self.check_access(queue, &state)?;

        f(&mut state)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Broker for MemoryConnection {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<QueueName, BrokerError> {
        self.ensure_open()?;

        let queue = if name.is_empty() {
            QueueName::new(format!("amq.gen-{}", Uuid::new_v4().simple()))
        } else {
            QueueName::new(name)
        };

        match self.broker.state.queues.entry(queue.clone()) {
            Entry::Occupied(entry) => self.check_access(entry.key(), entry.get())?,
            Entry::Vacant(_) if options.passive => return Err(BrokerError::QueueNotFound(queue)),
            Entry::Vacant(slot) => {
                slot.insert(QueueState::new(options.exclusive.then_some(self.id)));
            }
        }

        debug!(queue = %queue, exclusive = options.exclusive, "Queue declared");
        Ok(queue)
    }

    async fn bind_queue(
        &self,
        queue: &QueueName,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.broker.state.ensure_exchange(exchange)?;

        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        self.with_queue(queue, |state| {
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn unbind_queue(
        &self,
        queue: &QueueName,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.with_queue(queue, |state| {
            let position = state
                .bindings
                .iter()
                .position(|b| b.exchange == exchange && b.pattern == pattern)
                .ok_or_else(|| BrokerError::BindingNotFound {
                    queue: queue.clone(),
                    exchange: exchange.to_string(),
                    pattern: pattern.to_string(),
                })?;
            state.bindings.remove(position);
            Ok(())
        })
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
        self.with_queue(queue, |_| Ok(()))?;
        self.broker.state.remove_queue(queue);

        debug!(queue = %queue, "Queue deleted");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &QueueName,
        sink: DeliverySink,
    ) -> Result<ConsumerTag, BrokerError> {
        let tag = self.with_queue(queue, |state| {
            let tag = ConsumerTag::new(format!("ctag-{}", Uuid::new_v4().simple()));

            // Registered under the queue guard so a concurrent delete also drops the tag
            self.broker.state.consumers.insert(tag.clone(), queue.clone());
            state.consumers.push(Consumer {
                tag: tag.clone(),
                sink,
            });
            state.flush();
            Ok(tag)
        })?;

        debug!(queue = %queue, consumer = %tag, "Consumer registered");
        Ok(tag)
    }

    async fn cancel(&self, consumer: &ConsumerTag) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let (_, queue) = self
            .broker
            .state
            .consumers
            .remove(consumer)
            .ok_or_else(|| BrokerError::ConsumerNotFound(consumer.clone()))?;

        if let Some(mut state) = self.broker.state.queues.get_mut(&queue) {
            state.consumers.retain(|c| &c.tag != consumer);
        }

        debug!(queue = %queue, consumer = %consumer, "Consumer cancelled");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content_type: ContentType,
        body: Bytes,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.state.ensure_exchange(exchange)?;

        let mut routed = 0usize;
        for mut entry in self.broker.state.queues.iter_mut() {
            let state = entry.value_mut();
            if !state.is_bound(exchange, routing_key) {
                continue;
            }

            state.enqueue(Delivery {
                delivery_tag: self.broker.state.next_delivery_tag(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                content_type: content_type.clone(),
                body: body.clone(),
                redelivered: false,
            });
            routed += 1;
        }

        trace!(exchange = %exchange, routing_key = %routing_key, routed, "Message published");
        Ok(())
    }

    async fn ack(&self, queue: &QueueName, delivery: DeliveryTag) -> Result<(), BrokerError> {
        self.with_queue(queue, |state| {
            state
                .unacked
                .remove(&delivery)
                .map(|_| ())
                .ok_or_else(|| BrokerError::UnknownDelivery {
                    queue: queue.clone(),
                    tag: delivery,
                })
        })
    }

    async fn reject(
        &self,
        queue: &QueueName,
        delivery: DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.with_queue(queue, |state| {
            let mut message =
                state
                    .unacked
                    .remove(&delivery)
                    .ok_or_else(|| BrokerError::UnknownDelivery {
                        queue: queue.clone(),
                        tag: delivery,
                    })?;

            if requeue {
                message.redelivered = true;
                state.ready.push_front(message);
                state.flush();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    const EXCHANGE: &str = "socket";

    fn broker() -> MemoryBroker {
        MemoryBroker::new().with_exchange(EXCHANGE)
    }

    async fn publish(conn: &MemoryConnection, routing_key: &str, body: &'static str) {
        conn.publish(
            EXCHANGE,
            routing_key,
            ContentType::Json,
            Bytes::from_static(body.as_bytes()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_anonymous_queue_gets_generated_name() {
        let broker = broker();
        let conn = broker.connect();

        let a = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        let b = conn.declare_queue("", QueueOptions::default()).await.unwrap();

        assert!(a.as_str().starts_with("amq.gen-"));
        assert_ne!(a, b);
        assert_eq!(broker.queue_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding() {
        let broker = broker();
        let conn = broker.connect();

        let q1 = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        let q2 = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        conn.bind_queue(&q1, EXCHANGE, "downstream.c1.#").await.unwrap();
        conn.bind_queue(&q2, EXCHANGE, "downstream.c2.#").await.unwrap();

        publish(&conn, "downstream.c1.joined", "{}").await;
        publish(&conn, "downstream.c1.left.extra", "{}").await;
        publish(&conn, "downstream.c2.joined", "{}").await;
        publish(&conn, "upstream.c1.move", "{}").await;

        assert_eq!(broker.ready_count(&q1), 2);
        assert_eq!(broker.ready_count(&q2), 1);
    }

    #[tokio::test]
    async fn test_unknown_exchange_rejected() {
        let broker = broker();
        let conn = broker.connect();
        let queue = conn.declare_queue("", QueueOptions::default()).await.unwrap();

        let result = conn.bind_queue(&queue, "missing", "#").await;
        assert!(matches!(result, Err(BrokerError::ExchangeNotFound(ref e)) if e == "missing"));

        let result = conn
            .publish("missing", "a.b", ContentType::Json, Bytes::new())
            .await;
        assert!(matches!(result, Err(BrokerError::ExchangeNotFound(_))));
    }

    #[tokio::test]
    async fn test_consume_flushes_backlog_and_tracks_unacked() {
        let broker = broker();
        let conn = broker.connect();
        let queue = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        conn.bind_queue(&queue, EXCHANGE, "downstream.c1.#").await.unwrap();

        publish(&conn, "downstream.c1.a", "1").await;

        let (sink, mut deliveries) = mpsc::unbounded_channel();
        let tag = conn.consume(&queue, sink).await.unwrap();
        assert!(broker.has_consumer(&queue));

        publish(&conn, "downstream.c1.b", "2").await;

        let first = deliveries.recv().await.unwrap();
        let second = deliveries.recv().await.unwrap();
        assert_eq!(first.routing_key, "downstream.c1.a");
        assert_eq!(second.routing_key, "downstream.c1.b");
        assert_eq!(broker.ready_count(&queue), 0);
        assert_eq!(broker.unacked_count(&queue), 2);

        conn.ack(&queue, first.delivery_tag).await.unwrap();
        conn.ack(&queue, second.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(&queue), 0);

        // A delivery can only be acknowledged once
        let again = conn.ack(&queue, first.delivery_tag).await;
        assert!(matches!(again, Err(BrokerError::UnknownDelivery { .. })));

        conn.cancel(&tag).await.unwrap();
        assert!(!broker.has_consumer(&queue));
        assert!(matches!(
            conn.cancel(&tag).await,
            Err(BrokerError::ConsumerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_consumers_on_shared_queue_served_in_turn() {
        let broker = broker();
        let first = broker.connect();
        let second = broker.connect();

        let queue = first.declare_queue("workers", QueueOptions::default()).await.unwrap();
        first.bind_queue(&queue, EXCHANGE, "upstream.#").await.unwrap();

        let (sink_a, mut rx_a) = mpsc::unbounded_channel();
        let (sink_b, mut rx_b) = mpsc::unbounded_channel();
        let tag_a = first.consume(&queue, sink_a).await.unwrap();
        second.consume(&queue, sink_b).await.unwrap();
        assert_eq!(broker.consumer_count(&queue), 2);

        for key in ["upstream.c1.a", "upstream.c1.b", "upstream.c1.c"] {
            publish(&first, key, "{}").await;
        }

        assert_eq!(rx_a.recv().await.unwrap().routing_key, "upstream.c1.a");
        assert_eq!(rx_b.recv().await.unwrap().routing_key, "upstream.c1.b");
        assert_eq!(rx_a.recv().await.unwrap().routing_key, "upstream.c1.c");

        // The remaining consumer takes over everything
        first.cancel(&tag_a).await.unwrap();
        assert_eq!(broker.consumer_count(&queue), 1);

        publish(&first, "upstream.c1.d", "{}").await;
        assert_eq!(rx_b.recv().await.unwrap().routing_key, "upstream.c1.d");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_queue_forgets_its_consumers() {
        let broker = broker();
        let conn = broker.connect();
        let queue = conn.declare_queue("", QueueOptions::default()).await.unwrap();

        let (sink, _deliveries) = mpsc::unbounded_channel();
        let tag = conn.consume(&queue, sink).await.unwrap();
        conn.delete_queue(&queue).await.unwrap();

        assert!(matches!(
            conn.cancel(&tag).await,
            Err(BrokerError::ConsumerNotFound(ref t)) if t == &tag
        ));
    }

    #[tokio::test]
    async fn test_passive_declare_only_checks_existence() {
        let broker = broker();
        let conn = broker.connect();
        let passive = QueueOptions::builder().passive(true).build();

        assert!(matches!(
            conn.declare_queue("backend", passive).await,
            Err(BrokerError::QueueNotFound(_))
        ));
        assert_eq!(broker.queue_count(), 0);

        conn.declare_queue("backend", QueueOptions::default()).await.unwrap();
        let queue = conn.declare_queue("backend", passive).await.unwrap();
        assert_eq!(queue.as_str(), "backend");
        assert_eq!(broker.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = broker();
        let conn = broker.connect();
        let queue = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        conn.bind_queue(&queue, EXCHANGE, "#").await.unwrap();

        let (sink, mut deliveries) = mpsc::unbounded_channel();
        conn.consume(&queue, sink).await.unwrap();
        publish(&conn, "downstream.c1.a", "1").await;

        let delivery = deliveries.recv().await.unwrap();
        assert!(!delivery.redelivered);
        conn.reject(&queue, delivery.delivery_tag, true).await.unwrap();

        let again = deliveries.recv().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.delivery_tag, delivery.delivery_tag);

        conn.reject(&queue, again.delivery_tag, false).await.unwrap();
        assert_eq!(broker.unacked_count(&queue), 0);
        assert_eq!(broker.ready_count(&queue), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_returns_message_to_ready() {
        let broker = broker();
        let conn = broker.connect();
        let queue = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        conn.bind_queue(&queue, EXCHANGE, "#").await.unwrap();

        let (sink, deliveries) = mpsc::unbounded_channel();
        conn.consume(&queue, sink).await.unwrap();
        drop(deliveries);

        publish(&conn, "downstream.c1.a", "1").await;

        assert_eq!(broker.ready_count(&queue), 1);
        assert_eq!(broker.unacked_count(&queue), 0);
        assert!(!broker.has_consumer(&queue));
    }

    #[tokio::test]
    async fn test_unbind_and_delete() {
        let broker = broker();
        let conn = broker.connect();
        let queue = conn.declare_queue("", QueueOptions::default()).await.unwrap();
        conn.bind_queue(&queue, EXCHANGE, "downstream.c1.#").await.unwrap();
        assert_eq!(broker.binding_count(&queue), 1);

        conn.unbind_queue(&queue, EXCHANGE, "downstream.c1.#").await.unwrap();
        assert_eq!(broker.binding_count(&queue), 0);
        assert!(matches!(
            conn.unbind_queue(&queue, EXCHANGE, "downstream.c1.#").await,
            Err(BrokerError::BindingNotFound { .. })
        ));

        conn.delete_queue(&queue).await.unwrap();
        assert!(!broker.queue_exists(&queue));
        assert!(matches!(
            conn.delete_queue(&queue).await,
            Err(BrokerError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exclusive_queue_locked_to_connection() {
        let broker = broker();
        let owner = broker.connect();
        let other = broker.connect();

        let queue = owner
            .declare_queue("", QueueOptions::builder().exclusive(true).build())
            .await
            .unwrap();

        let (sink, _deliveries) = mpsc::unbounded_channel();
        let result = other.consume(&queue, sink).await;
        assert!(matches!(result, Err(BrokerError::ExclusiveLocked(_))));
        assert!(matches!(
            other.delete_queue(&queue).await,
            Err(BrokerError::ExclusiveLocked(_))
        ));
    }

    #[tokio::test]
    async fn test_close_deletes_exclusive_queues_only() {
        let broker = broker();
        let conn = broker.connect();

        let exclusive = conn
            .declare_queue("", QueueOptions::builder().exclusive(true).build())
            .await
            .unwrap();
        let shared = conn.declare_queue("shared", QueueOptions::default()).await.unwrap();

        drop(conn);

        assert!(!broker.queue_exists(&exclusive));
        assert!(broker.queue_exists(&shared));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let broker = broker();
        let conn = broker.connect();
        conn.close();

        assert!(conn.is_closed());
        assert!(matches!(
            conn.declare_queue("", QueueOptions::default()).await,
            Err(BrokerError::ConnectionClosed)
        ));
    }
}
