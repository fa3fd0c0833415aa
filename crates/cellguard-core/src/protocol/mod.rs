//! Wire format for the worker channel.
//!
//! Every line on the wire is one JSON envelope
//! `{"content_type": "Request" | "Response" | "Event", "body": {...}}`.
//! Request and response bodies follow JSON-RPC 2.0; event bodies are free-form
//! objects carrying their topic under [`EVENT_TOPIC_FIELD`].

mod messages;

pub use messages::*;

use crate::error::ChannelError;
use derive_more::{Display, From};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

/// Field of an event body that names its topic
pub const EVENT_TOPIC_FIELD: &str = "EventTopic";

/// JSON-RPC 2.0 reserved error codes
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Correlation identifier shared by a request and its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId(id.to_string())
    }
}

/// Produces request ids of the form `<prefix>-<counter>`.
///
/// The prefix is random per generator so ids from different clients never collide
/// on a shared channel. Tests inject a fixed prefix.
#[derive(Debug)]
pub struct RequestIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::with_prefix(Uuid::new_v4().simple().to_string())
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId(format!("{}-{n}", self.prefix))
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    pub id: RequestId,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            id,
            params,
        }
    }

    /// Decode the params into the shape a handler expects
    pub fn parse_params<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.params.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Either side of a response; never both, never neither
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Success(Value),
    Failure(JsonRpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub outcome: ResponseOutcome,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            outcome: ResponseOutcome::Success(result),
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            outcome: ResponseOutcome::Failure(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Failure(_))
    }

    /// Convert into the typed result, surfacing error responses as [`ChannelError::Remote`]
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ChannelError> {
        match self.outcome {
            ResponseOutcome::Success(value) => Ok(serde_json::from_value(value)?),
            ResponseOutcome::Failure(error) => Err(error.into()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    #[serde(default = "default_version")]
    jsonrpc: String,
    id: RequestId,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// Keeps an explicit `"result": null` distinguishable from a missing field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for JsonRpcResponse {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => ResponseOutcome::Success(result),
            (None, Some(error)) => ResponseOutcome::Failure(error),
            (Some(_), Some(_)) => {
                return Err(format!("response {} carries both result and error", raw.id));
            }
            (None, None) => {
                return Err(format!("response {} carries neither result nor error", raw.id));
            }
        };
        Ok(Self {
            jsonrpc: raw.jsonrpc,
            id: raw.id,
            outcome,
        })
    }
}

impl From<JsonRpcResponse> for RawResponse {
    fn from(response: JsonRpcResponse) -> Self {
        let (result, error) = match response.outcome {
            ResponseOutcome::Success(value) => (Some(value), None),
            ResponseOutcome::Failure(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: response.jsonrpc,
            id: response.id,
            result,
            error,
        }
    }
}

/// Event bodies are passed around as plain JSON objects
pub type EventMessage = Map<String, Value>;

/// Build an event body from a serializable payload, tagging it with `topic`
pub fn event_body<T: Serialize>(topic: &str, event: &T) -> Result<EventMessage, ChannelError> {
    match serde_json::to_value(event)? {
        Value::Object(mut body) => {
            body.insert(EVENT_TOPIC_FIELD.to_string(), Value::String(topic.to_string()));
            Ok(body)
        }
        other => Err(ChannelError::ProtocolViolation(format!(
            "event payload must be a JSON object, got {other}"
        ))),
    }
}

/// Topic an event body was published under, if any
pub fn event_topic(event: &EventMessage) -> Option<&str> {
    event.get(EVENT_TOPIC_FIELD).and_then(Value::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum ContentType {
    Request,
    Response,
    Event,
}

impl ContentType {
    /// Case-insensitive match against the three known kinds
    pub fn parse(value: &str) -> Option<Self> {
        [ContentType::Request, ContentType::Response, ContentType::Event]
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(value))
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    content_type: ContentType,
    body: &'a T,
}

/// Serialize `body` into one envelope line, without the trailing newline
pub fn wrap<T: Serialize>(content_type: ContentType, body: &T) -> Result<String, ChannelError> {
    Ok(serde_json::to_string(&Envelope { content_type, body })?)
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Event(EventMessage),
}

impl InboundMessage {
    pub fn content_type(&self) -> ContentType {
        match self {
            InboundMessage::Request(_) => ContentType::Request,
            InboundMessage::Response(_) => ContentType::Response,
            InboundMessage::Event(_) => ContentType::Event,
        }
    }

    /// Classify and decode one line. Any failure is a [`ChannelError::Framing`].
    pub fn parse_line(line: &str) -> Result<Self, ChannelError> {
        let envelope: Value = serde_json::from_str(line)
            .map_err(|e| ChannelError::Framing(format!("invalid JSON: {e}")))?;
        let Value::Object(mut envelope) = envelope else {
            return Err(ChannelError::Framing("envelope is not a JSON object".into()));
        };

        let content_type = match envelope.get("content_type") {
            Some(Value::String(kind)) => ContentType::parse(kind)
                .ok_or_else(|| ChannelError::Framing(format!("unknown content_type '{kind}'")))?,
            Some(_) => return Err(ChannelError::Framing("content_type is not a string".into())),
            None => return Err(ChannelError::Framing("missing content_type".into())),
        };
        let body = envelope
            .remove("body")
            .ok_or_else(|| ChannelError::Framing("missing body".into()))?;

        match content_type {
            ContentType::Request => serde_json::from_value(body)
                .map(InboundMessage::Request)
                .map_err(|e| ChannelError::Framing(format!("invalid request body: {e}"))),
            ContentType::Response => serde_json::from_value(body)
                .map(InboundMessage::Response)
                .map_err(|e| ChannelError::Framing(format!("invalid response body: {e}"))),
            ContentType::Event => match body {
                Value::Object(event) => Ok(InboundMessage::Event(event)),
                _ => Err(ChannelError::Framing("event body is not a JSON object".into())),
            },
        }
    }
}
