//! Wire shapes exchanged with the push server.
//!
//! Outbound subscription management travels as event [`SUBSCRIPTION_EVENT`]
//! with a [`SubscriptionRequest`] payload. The server confirms with
//! [`SUBSCRIBED_EVENT`] / [`UNSUBSCRIBED_EVENT`] or refuses with
//! [`SUBSCRIPTION_ERROR_EVENT`]. Data pushes carry a [`PushUpdate`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MergeError;

pub const SUBSCRIPTION_EVENT: &str = "subscription";
pub const SUBSCRIBED_EVENT: &str = "subscribed";
pub const UNSUBSCRIBED_EVENT: &str = "unsubscribed";
pub const SUBSCRIPTION_ERROR_EVENT: &str = "subscription_error";
pub const DEFAULT_UPDATE_EVENT: &str = "resource_update";
/// Local-only event raised when inbound pushes were dropped before dispatch.
/// Payload: `{"skipped": <count>}`.
pub const RESYNC_EVENT: &str = "resync";

/// Field key meaning "the payload is the whole entity".
pub const ALL_FIELDS: &str = "all";

/// Stable identity of a tracked entity, written `type:id` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    resource_type: String,
    id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.id)
    }
}

impl FromStr for ResourceKey {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, id)) if !kind.is_empty() && !id.is_empty() => Ok(Self::new(kind, id)),
            _ => Err(MergeError::MalformedUpdate(format!(
                "resource key {s:?} is not of the form type:id"
            ))),
        }
    }
}

impl Serialize for ResourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub op: SubscriptionOp,
    pub resource_key: ResourceKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionAck {
    pub resource_key: ResourceKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRejection {
    pub resource_key: ResourceKey,
    #[serde(default)]
    pub reason: String,
}

/// Opaque per-delivery token. Servers send strings or numbers; both compare
/// by their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UpdateId(String);

impl UpdateId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UpdateId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => UpdateId(text),
            Raw::Number(number) => UpdateId(number.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushUpdate {
    pub resource_key: ResourceKey,
    #[serde(default = "all_fields")]
    pub field_key: String,
    pub update_id: UpdateId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn all_fields() -> String {
    ALL_FIELDS.to_string()
}

impl PushUpdate {
    pub fn new(
        resource_key: ResourceKey,
        field_key: impl Into<String>,
        update_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            resource_key,
            field_key: field_key.into(),
            update_id: UpdateId::new(update_id),
            payload,
        }
    }

    /// Decodes a pushed event body.
    ///
    /// On failure the resource key is still returned when it can be read, so
    /// the caller can fall back to invalidating that entry.
    pub fn from_wire(
        value: &serde_json::Value,
    ) -> Result<Self, (Option<ResourceKey>, MergeError)> {
        PushUpdate::deserialize(value).map_err(|err| {
            let key = value
                .get("resourceKey")
                .and_then(|key| key.as_str())
                .and_then(|key| key.parse().ok());
            (key, MergeError::MalformedUpdate(err.to_string()))
        })
    }

    pub fn is_whole_entity(&self) -> bool {
        self.field_key == ALL_FIELDS
    }
}
