pub mod error;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::channel::ChannelId;
use crate::handler::MessageHandler;
use crate::session::{ChannelSession, Completion, SessionConfig};

pub use self::error::RegistryError;

/// Handle returned by [`SessionRegistry::open`].
///
/// A channel can have several sessions at once (one per browser tab, say), so the channel id
/// alone cannot address one of them.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct SessionId(Uuid);

impl SessionId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Live channel sessions sharing one broker handle and configuration.
///
/// Any number of sessions may be open for the same channel; each is addressed by its own
/// [`SessionId`].
pub struct SessionRegistry {
    broker: Arc<dyn Broker>,
    config: SessionConfig,
    sessions: DashMap<SessionId, ChannelSession, ahash::RandomState>,
}

impl SessionRegistry {
    pub fn new(broker: Arc<dyn Broker>, config: SessionConfig) -> Self {
        Self {
            broker,
            config,
            sessions: DashMap::default(),
        }
    }

    /// Open a session for `channel` and register it.
    pub async fn open<H: MessageHandler>(
        &self,
        channel: impl Into<ChannelId>,
        handler: H,
    ) -> Result<SessionId, RegistryError> {
        let session = ChannelSession::open(
            Arc::clone(&self.broker),
            self.config.clone(),
            channel,
            handler,
        )
        .await?;

        let session_id = SessionId::random();
        info!(
            session_id = %session_id,
            channel = %session.channel(),
            "Session registered"
        );
        self.sessions.insert(session_id, session);

        Ok(session_id)
    }

    /// [`ChannelSession::send`] on the session registered as `session_id`.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        session_id: &SessionId,
        command: &str,
        payload: &T,
    ) -> Result<Completion, RegistryError> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or(RegistryError::SessionNotFound {
                session_id: *session_id,
            })?;

        Ok(session.send(command, payload)?)
    }

    /// Unregister and destroy a session.
    pub fn close(&self, session_id: &SessionId) -> Result<Completion, RegistryError> {
        let (_, session) =
            self.sessions
                .remove(session_id)
                .ok_or(RegistryError::SessionNotFound {
                    session_id: *session_id,
                })?;

        info!(
            session_id = %session_id,
            channel = %session.channel(),
            "Session unregistered"
        );
        Ok(session.destroy()?)
    }

    /// Close every registered session.
    pub fn close_all(&self) -> Vec<Completion> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        self.close_many(&ids)
    }

    /// Close each of `ids`, logging and skipping the ones that fail.
    fn close_many(&self, ids: &[SessionId]) -> Vec<Completion> {
        ids.iter()
            .filter_map(|id| match self.close(id) {
                Ok(completion) => Some(completion),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Failed to close session");
                    None
                }
            })
            .collect()
    }

    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn channel_of(&self, session_id: &SessionId) -> Option<ChannelId> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.channel().clone())
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions_for_channel(&self, channel: &ChannelId) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.channel() == channel)
            .count()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
