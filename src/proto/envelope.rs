//! Request and response JSON envelopes.
//!
//! The wire format is deliberately permissive on the way in — every
//! field is optional and validation happens in [`Envelope::classify`],
//! so one malformed message can be logged and dropped without touching
//! the connection. Outbound envelopes are built through constructors
//! that make invalid combinations unrepresentable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::params::Params;
use crate::error::RpcError;

/// The `"client"` field of a request: a single subscription id, or a
/// batch of ids on an unsubscribe action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientRef {
    /// One subscription id.
    One(String),
    /// A batch of subscription ids (unsubscribe only).
    Many(Vec<String>),
}

/// Permissive request envelope. All fields optional; classification
/// into a validated [`Inbound`] happens separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Out-of-band action, currently only `"unsubscribe"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Subscription correlation id(s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientRef>,
    /// One-shot call correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Target method as `"<namespace>.<name>"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Invocation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

/// A validated inbound message, ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Remove the named subscriptions.
    Unsubscribe {
        /// Subscription ids to drop.
        clients: Vec<String>,
    },
    /// Invoke a method. With a `client` id this is a subscription; with
    /// a `callback` id a one-shot call; with neither, fire-and-forget.
    Invoke {
        /// Target method name.
        method: String,
        /// Subscription correlation id, if any.
        client: Option<String>,
        /// One-shot correlation id, if any.
        callback: Option<String>,
        /// Invocation parameters.
        params: Option<Params>,
    },
}

impl Envelope {
    /// Builds a one-shot call request.
    #[must_use]
    pub fn call(method: &str, params: Option<Params>, callback: &str) -> Self {
        Self {
            callback: Some(callback.to_string()),
            method: Some(method.to_string()),
            params,
            ..Self::default()
        }
    }

    /// Builds a subscription request.
    #[must_use]
    pub fn subscribe(method: &str, params: Option<Params>, client: &str) -> Self {
        Self {
            client: Some(ClientRef::One(client.to_string())),
            method: Some(method.to_string()),
            params,
            ..Self::default()
        }
    }

    /// Builds a batched unsubscribe request.
    #[must_use]
    pub fn unsubscribe(clients: Vec<String>) -> Self {
        Self {
            action: Some("unsubscribe".to_string()),
            client: Some(ClientRef::Many(clients)),
            ..Self::default()
        }
    }

    /// Parses a raw text frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] when the frame is not a JSON
    /// object of the expected shape.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        serde_json::from_str(text)
            .map_err(|e| RpcError::Protocol(format!("malformed message: {e}")))
    }

    /// Serializes this envelope to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if a parameter value cannot
    /// be serialized.
    pub fn to_text(&self) -> Result<String, RpcError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validates this envelope into an [`Inbound`] message.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] when the envelope names an
    /// unknown action, carries both correlation id kinds, uses a
    /// batched client id outside an unsubscribe, or has neither an
    /// action nor a method.
    pub fn classify(self) -> Result<Inbound, RpcError> {
        if let Some(action) = &self.action {
            if action != "unsubscribe" {
                return Err(RpcError::Protocol(format!("unknown action {action:?}")));
            }
            let clients = match self.client {
                Some(ClientRef::One(id)) => vec![id],
                Some(ClientRef::Many(ids)) => ids,
                None => {
                    return Err(RpcError::Protocol(
                        "unsubscribe without client ids".to_string(),
                    ));
                }
            };
            return Ok(Inbound::Unsubscribe { clients });
        }

        let Some(method) = self.method else {
            return Err(RpcError::Protocol("message has no method".to_string()));
        };
        let client = match self.client {
            Some(ClientRef::One(id)) => Some(id),
            Some(ClientRef::Many(_)) => {
                return Err(RpcError::Protocol(
                    "batched client ids are only valid for unsubscribe".to_string(),
                ));
            }
            None => None,
        };
        if client.is_some() && self.callback.is_some() {
            return Err(RpcError::Protocol(
                "a request is either a call or a subscription, never both".to_string(),
            ));
        }
        Ok(Inbound::Invoke {
            method,
            client,
            callback: self.callback,
            params: self.params,
        })
    }
}

/// Response envelope: echoes the request's correlation id plus exactly
/// one of `"data"` or `"error"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoed subscription id, for subscription replies and pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Echoed one-shot call id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Successful result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Builds a success response for a one-shot call.
    #[must_use]
    pub fn call_data(callback: &str, data: Value) -> Self {
        Self {
            callback: Some(callback.to_string()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Builds a success response or push for a subscription.
    #[must_use]
    pub fn client_data(client: &str, data: Value) -> Self {
        Self {
            client: Some(client.to_string()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Builds an error response echoing whichever correlation id the
    /// request carried.
    #[must_use]
    pub fn error(client: Option<&str>, callback: Option<&str>, error: &RpcError) -> Self {
        Self {
            client: client.map(str::to_string),
            callback: callback.map(str::to_string),
            error: Some(error.wire_message()),
            ..Self::default()
        }
    }

    /// The correlation id this response references, preferring the
    /// subscription id when both are present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.client.as_deref().or(self.callback.as_deref())
    }

    /// Parses a raw text frame into a response envelope.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] when the frame is not a JSON
    /// object of the expected shape.
    pub fn parse(text: &str) -> Result<Self, RpcError> {
        serde_json::from_str(text)
            .map_err(|e| RpcError::Protocol(format!("malformed response: {e}")))
    }

    /// Serializes this response to a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if the payload cannot be
    /// serialized.
    pub fn to_text(&self) -> Result<String, RpcError> {
        Ok(serde_json::to_string(self)?)
    }
}
