//! Per-channel request/response over a topic exchange.
//!
//! # Topic format
//!
//! Every message travels through one topic exchange. Routing keys are namespaced by direction
//! and channel:
//!
//! - Requests: `{upstream_prefix}.{channel}.{command}`, published by a [`ChannelSession`] and
//!   consumed by a [`Responder`] bound to `{upstream_prefix}.#`.
//! - Responses: `{downstream_prefix}.{channel}.{command}`, published by a [`Responder`] and
//!   consumed by every session bound to `{downstream_prefix}.{channel}.#`.
//!
//! The prefixes default to `upstream` and `downstream` and are configured through
//! [`Namespace`]. Bodies are JSON, tagged with the `application/json` content type.
//!
//! # Lifecycle
//!
//! A session declares an exclusive server-named queue, binds it, and starts consuming. It is
//! active once the broker confirms the consumer. [`ChannelSession::destroy`] cancels the
//! consumer, unbinds and deletes the queue; a consumer confirmed after destroy is cancelled on
//! arrival.

pub mod broker;
pub mod channel;
pub mod dispatch;
pub mod handler;
pub mod namespace;
pub mod payload;
pub mod registry;
pub mod responder;
pub mod session;
pub mod state_machine;

pub use broker::{Broker, BrokerError, ContentType, Delivery, MemoryBroker, MemoryConnection};
pub use channel::ChannelId;
pub use dispatch::DeliveryError;
pub use handler::{Message, MessageHandler};
pub use namespace::{Namespace, Route};
pub use payload::Payload;
pub use registry::{RegistryError, SessionId, SessionRegistry};
pub use responder::{Listener, Responder};
pub use session::{ChannelSession, Completion, LifecycleState, SessionConfig, SessionError};
