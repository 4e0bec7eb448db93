//! Wire-format types exchanged over a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::SubscriptionId;

use crate::errors::BrokerError;

/// Event type carried by subscription deliveries.
pub const SUBSCRIPTION_EVENT: &str = "subscription.event";

/// Inbound request from a UI surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Caller-chosen request id, echoed on the response.
    pub id: String,
    /// Message type (e.g. `keyring.unlock`).
    #[serde(rename = "type")]
    pub message_type: String,
    /// Request payload; absent means `null`.
    #[serde(default)]
    pub payload: Value,
}

/// Reply to exactly one inbound request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echoed request id.
    pub id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result payload (present when `success`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present when not `success`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Uniform error envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (e.g. `NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Server-pushed event: a subscription delivery or a channel notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Request id of the subscribe call that created the subscription.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Subscription the delivery belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
    /// Event payload.
    pub data: Value,
}

/// Anything the broker sends down a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelMessage {
    /// Reply to one request.
    Response(Response),
    /// Subscription delivery or notice.
    Event(ChannelEvent),
}

/// Successful outcome of a dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Call result.
    Value(Value),
    /// A subscription was registered; `current` is the value at subscribe time.
    Subscribed {
        /// New subscription.
        subscription_id: SubscriptionId,
        /// Current value of the stream.
        current: Value,
    },
}

impl Reply {
    /// JSON shape sent as the response `result`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Subscribed {
                subscription_id,
                current,
            } => serde_json::json!({
                "subscriptionId": subscription_id,
                "current": current,
            }),
        }
    }
}

impl Response {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response from a broker error.
    pub fn failure(id: impl Into<String>, err: &BrokerError) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(err.to_error_body()),
        }
    }

    /// Build the response for a dispatch outcome.
    pub fn from_outcome(id: impl Into<String>, outcome: Result<Reply, BrokerError>) -> Self {
        match outcome {
            Ok(reply) => Self::success(id, reply.into_value()),
            Err(err) => Self::failure(id, &err),
        }
    }
}

impl ChannelEvent {
    /// A subscription delivery.
    pub fn delivery(request_id: impl Into<String>, subscription_id: SubscriptionId, data: Value) -> Self {
        Self {
            event_type: SUBSCRIPTION_EVENT.to_owned(),
            id: Some(request_id.into()),
            subscription_id: Some(subscription_id),
            data,
        }
    }

    /// A notice not tied to any request.
    pub fn notice(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            id: None,
            subscription_id: None,
            data,
        }
    }
}
