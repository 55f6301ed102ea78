//! Translation between channel/command semantics and broker topic strings.
//!
//! ## Topic Format
//!
//! - Requests are published at: `{upstream_prefix}.{channel}.{command}`
//! - Responses are published at: `{downstream_prefix}.{channel}.{command}[.{trailing}...]`
//! - A channel session listens on: `{downstream_prefix}.{channel}.#`
//!
//! Example with the default prefixes:
//! - Client sends: `upstream.room42.move`
//! - Backend replies: `downstream.room42.joined`
//!
//! Prefixes may span several segments (e.g. `socket.downstream`). The command is always the
//! segment immediately after the channel.

pub mod error;

use bon::Builder;

use crate::channel::ChannelId;

use self::error::NamespaceError;

pub const DELIMITER: char = '.';
pub const MULTI_WORD_WILDCARD: &str = "#";
pub const SINGLE_WORD_WILDCARD: &str = "*";

pub const DEFAULT_UPSTREAM_PREFIX: &str = "upstream";
pub const DEFAULT_DOWNSTREAM_PREFIX: &str = "downstream";

/// Topic prefixes for the two directions of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Namespace {
    /// Prefix of client-to-backend topics.
    #[builder(default = DEFAULT_UPSTREAM_PREFIX.to_string())]
    pub upstream_prefix: String,

    /// Prefix of backend-to-client topics.
    #[builder(default = DEFAULT_DOWNSTREAM_PREFIX.to_string())]
    pub downstream_prefix: String,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A routing key split into its channel and command segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Command(CommandRoute),

    /// The routing key did not carry the expected prefix, channel and command segments.
    Malformed { routing_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRoute {
    pub channel: ChannelId,
    pub command: String,
    /// Segments after the command, in order.
    pub trailing: Vec<String>,
}

impl Route {
    pub fn command(&self) -> Option<&str> {
        match self {
            Route::Command(route) => Some(&route.command),
            Route::Malformed { .. } => None,
        }
    }

    pub fn channel(&self) -> Option<&ChannelId> {
        match self {
            Route::Command(route) => Some(&route.channel),
            Route::Malformed { .. } => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Route::Malformed { .. })
    }
}

impl Namespace {
    /// Topic a channel publishes `command` requests to.
    pub fn upstream_topic(
        &self,
        channel: &ChannelId,
        command: &str,
    ) -> Result<String, NamespaceError> {
        topic(&self.upstream_prefix, channel, command)
    }

    /// Topic the backend publishes `command` responses to for one channel.
    pub fn downstream_topic(
        &self,
        channel: &ChannelId,
        command: &str,
    ) -> Result<String, NamespaceError> {
        topic(&self.downstream_prefix, channel, command)
    }

    /// Wildcard pattern covering every downstream message of `channel`.
    pub fn downstream_binding_pattern(&self, channel: &ChannelId) -> Result<String, NamespaceError> {
        if channel.is_empty() {
            return Err(NamespaceError::EmptyChannel);
        }

        Ok(format!(
            "{}{DELIMITER}{channel}{DELIMITER}{MULTI_WORD_WILDCARD}",
            self.downstream_prefix
        ))
    }

    /// Wildcard pattern covering upstream traffic of every channel.
    pub fn upstream_binding_pattern(&self) -> String {
        format!("{}{DELIMITER}{MULTI_WORD_WILDCARD}", self.upstream_prefix)
    }

    pub fn parse_response_route(&self, routing_key: &str) -> Route {
        parse_route(&self.downstream_prefix, routing_key)
    }

    pub fn parse_request_route(&self, routing_key: &str) -> Route {
        parse_route(&self.upstream_prefix, routing_key)
    }

    /// Borrowing shortcut for [`parse_response_route`](Self::parse_response_route) that only
    /// yields the command segment.
    pub fn extract_response_command<'a>(&self, routing_key: &'a str) -> Option<&'a str> {
        split_route(&self.downstream_prefix, routing_key).map(|(_, command, _)| command)
    }
}

fn topic(prefix: &str, channel: &ChannelId, command: &str) -> Result<String, NamespaceError> {
    if channel.is_empty() {
        return Err(NamespaceError::EmptyChannel);
    }
    if command.is_empty() {
        return Err(NamespaceError::EmptyCommand);
    }

    Ok(format!("{prefix}{DELIMITER}{channel}{DELIMITER}{command}"))
}

fn parse_route(prefix: &str, routing_key: &str) -> Route {
    match split_route(prefix, routing_key) {
        Some((channel, command, trailing)) => Route::Command(CommandRoute {
            channel: ChannelId::from(channel),
            command: command.to_string(),
            trailing: trailing.map(str::to_string).collect(),
        }),
        None => Route::Malformed {
            routing_key: routing_key.to_string(),
        },
    }
}

fn split_route<'a>(
    prefix: &str,
    routing_key: &'a str,
) -> Option<(&'a str, &'a str, impl Iterator<Item = &'a str>)> {
    let rest = routing_key
        .strip_prefix(prefix)?
        .strip_prefix(DELIMITER)?;

    let mut segments = rest.split(DELIMITER);
    let channel = segments.next().filter(|s| !s.is_empty())?;
    let command = segments.next().filter(|s| !s.is_empty())?;

    Some((channel, command, segments))
}
