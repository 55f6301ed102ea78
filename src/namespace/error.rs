/// Indicates that a topic could not be built because one of its segments was empty.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
    #[error("channel identifier must not be empty")]
    EmptyChannel,

    #[error("command must not be empty")]
    EmptyCommand,
}
