use std::collections::VecDeque;

use crate::broker::ConsumerTag;
use crate::state_machine::StateMachine;

/// Where a channel session is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Queue declared and bound, consumer registration not yet confirmed.
    Initializing,
    /// Consumer confirmed with the given tag.
    Active(ConsumerTag),
    Destroyed,
}

pub enum LifecycleInput {
    /// The broker confirmed a consumer registration.
    ConsumerConfirmed(ConsumerTag),
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutput {
    /// Release the queue, cancelling the consumer first when one was confirmed.
    Teardown { cancel: Option<ConsumerTag> },
    /// Cancel a consumer that must not stay registered.
    CancelOrphan(ConsumerTag),
}

/// Lifecycle of a channel session: `Initializing -> Active -> Destroyed`.
///
/// Destroy may arrive before the consumer confirmation. Teardown then skips the cancel step and
/// a confirmation arriving afterwards yields [`LifecycleOutput::CancelOrphan`].
#[derive(Debug)]
pub struct LifecycleMachine {
    state: LifecycleState,
    pending: VecDeque<LifecycleOutput>,
}

impl LifecycleMachine {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Initializing,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn consumer_tag(&self) -> Option<&ConsumerTag> {
        match &self.state {
            LifecycleState::Active(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.state == LifecycleState::Destroyed
    }

    fn confirm(&mut self, tag: ConsumerTag) {
        match self.state {
            LifecycleState::Initializing => self.state = LifecycleState::Active(tag),
            // At most one consumer per session
            LifecycleState::Active(_) | LifecycleState::Destroyed => {
                self.pending.push_back(LifecycleOutput::CancelOrphan(tag));
            }
        }
    }

    fn destroy(&mut self) {
        match std::mem::replace(&mut self.state, LifecycleState::Destroyed) {
            LifecycleState::Initializing => {
                self.pending
                    .push_back(LifecycleOutput::Teardown { cancel: None });
            }
            LifecycleState::Active(tag) => {
                self.pending
                    .push_back(LifecycleOutput::Teardown { cancel: Some(tag) });
            }
            LifecycleState::Destroyed => {}
        }
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for LifecycleMachine {
    type Input = LifecycleInput;
    type Output = LifecycleOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            LifecycleInput::ConsumerConfirmed(tag) => self.confirm(tag),
            LifecycleInput::Destroy => self.destroy(),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}
