use std::fmt;
use std::sync::Arc;

/// Names one client's slice of the exchange, e.g. a player or a chat room.
///
/// Requests from the client travel under `{upstream_prefix}.{channel}.*` and replies to it under
/// `{downstream_prefix}.{channel}.*`. The id becomes exactly one routing-key segment, so it must
/// not contain `.`; that is not checked here.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id cannot form a topic.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<&ChannelId> for ChannelId {
    fn from(id: &ChannelId) -> Self {
        id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_is_a_single_topic_segment() {
        let id = ChannelId::from(String::from("room42"));

        assert_eq!(id.to_string(), "room42");
        assert_eq!(id.as_ref(), "room42");
        assert_eq!(id, ChannelId::from("room42"));
        assert!(!id.is_empty());
        assert!(ChannelId::from("").is_empty());
    }
}
