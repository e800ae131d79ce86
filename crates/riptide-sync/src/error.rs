use riptide_channel::ChannelError;
use thiserror::Error;

use crate::protocol::ResourceKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("no credential available")]
    Unauthenticated,
    #[error("subscription for {key} rejected: {reason}")]
    Subscription { key: ResourceKey, reason: String },
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("handler for {event} failed: {detail}")]
    Handler { event: String, detail: String },
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RealtimeError {
    /// Connection and auth failures are the only kinds surfaced to users.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            RealtimeError::Connection(_)
                | RealtimeError::Unauthenticated
                | RealtimeError::Channel(ChannelError::Unauthorized(_))
        )
    }
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// A push payload that cannot be merged into the cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("{what} is not a JSON object")]
    NotAnObject { what: &'static str },
    #[error("payload is missing field {field}")]
    MissingField { field: String },
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
}
