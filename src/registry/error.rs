//! Error types for session registry management.

use crate::session::SessionError;

use super::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No session is registered under the id, or it was already closed.
    #[error("no active session {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error(transparent)]
    Session(#[from] SessionError),
}
