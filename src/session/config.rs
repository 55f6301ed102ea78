use bon::Builder;

use crate::namespace::Namespace;

pub const DEFAULT_EXCHANGE: &str = "socket";

/// Configuration shared by channel sessions and the responder.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Exchange requests are published to and session queues are bound to.
    /// It must already exist on the broker.
    #[builder(default = DEFAULT_EXCHANGE.to_string())]
    pub exchange: String,

    #[builder(default)]
    pub namespace: Namespace,

    /// Declare session queues exclusive to the session's broker connection.
    #[builder(default = true)]
    pub exclusive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
