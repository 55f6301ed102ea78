use std::future::Future;

use tokio::task::JoinHandle;

use crate::broker::BrokerError;

use super::error::SessionError;

/// Completion signal of a background broker operation (a publish or a teardown).
///
/// Failures are already logged when they happen. Awaiting the completion is optional and only
/// needed to synchronize with the operation, for example in tests. Dropping it does not cancel
/// the operation.
#[derive(Debug)]
pub struct Completion {
    handle: JoinHandle<Result<(), BrokerError>>,
}

impl Completion {
    pub(crate) fn spawn<F>(operation: F) -> Self
    where
        F: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(operation),
        }
    }

    /// Wait for the operation to finish, returning the first broker error it hit.
    pub async fn wait(self) -> Result<(), SessionError> {
        self.handle.await?.map_err(SessionError::from)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
