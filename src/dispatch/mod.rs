//! The inbound path shared by channel sessions and the backend responder:
//! decode the body, route it, invoke the handler, then acknowledge.

pub mod error;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

use crate::broker::{Broker, Delivery, QueueName};
use crate::handler::{Message, MessageHandler};
use crate::namespace::Route;
use crate::payload::Payload;

pub use self::error::DeliveryError;

/// Processes deliveries of one queue.
pub(crate) struct Dispatcher {
    broker: Arc<dyn Broker>,
    queue: QueueName,
    handler: Arc<dyn MessageHandler>,
}

impl Dispatcher {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        queue: QueueName,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            broker,
            queue,
            handler,
        }
    }

    /// Drive the delivery stream until it closes or `accepts` turns false.
    ///
    /// `route_fn` turns a routing key into the [`Route`] handed to the handler.
    pub(crate) async fn run<R, A>(
        self,
        mut deliveries: UnboundedReceiver<Delivery>,
        route_fn: R,
        accepts: A,
    ) where
        R: Fn(&str) -> Route,
        A: Fn() -> bool,
    {
        while let Some(delivery) = deliveries.recv().await {
            if !accepts() {
                debug!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    "Consumer closed, dropping delivery"
                );
                break;
            }

            let routing_key = delivery.routing_key.clone();
            let route = route_fn(&routing_key);

            match self.process(route, delivery).await {
                Ok(()) => {}
                Err(DeliveryError::HandlerPanic) => {
                    error!(queue = %self.queue, routing_key = %routing_key, "Handler panicked");
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        routing_key = %routing_key,
                        error = %e,
                        "Delivery not processed cleanly"
                    );
                }
            }
        }

        debug!(queue = %self.queue, "Delivery stream closed");
    }

    /// Process one delivery.
    ///
    /// Undecodable deliveries are rejected without requeue. Every other delivery is acknowledged
    /// exactly once, after the handler returned, whatever its outcome.
    pub(crate) async fn process(&self, route: Route, delivery: Delivery) -> Result<(), DeliveryError> {
        let tag = delivery.delivery_tag;

        let payload = match Payload::decode(&delivery.content_type, &delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                if let Err(reject_err) = self.broker.reject(&self.queue, tag, false).await {
                    warn!(
                        queue = %self.queue,
                        error = %reject_err,
                        "Failed to reject undecodable delivery"
                    );
                }
                return Err(DeliveryError::Decode(e));
            }
        };

        debug!(
            queue = %self.queue,
            routing_key = %delivery.routing_key,
            payload = ?payload,
            "Received"
        );

        let handled = self.invoke(Message { route, payload }).await;
        self.broker.ack(&self.queue, tag).await?;

        handled
    }

    async fn invoke(&self, message: Message) -> Result<(), DeliveryError> {
        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeliveryError::Handler(e)),
            Err(_) => Err(DeliveryError::HandlerPanic),
        }
    }
}
