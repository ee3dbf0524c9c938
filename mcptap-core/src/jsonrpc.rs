//! Minimal JSON-RPC 2.0 codec: permissive parse, kind classification, and
//! error-response construction.
//!
//! The proxy does not interpret MCP method schemas. Everything beyond what is
//! needed to classify a message is kept as an opaque [`RawValue`] fragment so
//! that forwarding (and the occasional rewrite) is byte-faithful. In
//! particular the `id` fragment is preserved verbatim — it may be a string, a
//! number, or `null`, and a synthesized error response must echo it exactly.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Classification of a JSON-RPC 2.0 message, derived from field presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Has `method` and `id` — expects a response.
    Request,
    /// No `method`, no `error` — a result for a previous request.
    Response,
    /// Has `method` but no `id` — fire-and-forget.
    Notification,
    /// Carries an `error` object.
    Error,
}

impl MessageKind {
    /// The wire/database string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Error => "error",
        }
    }

    /// Parse the wire/database string back into a kind.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "request" => Some(MessageKind::Request),
            "response" => Some(MessageKind::Response),
            "notification" => Some(MessageKind::Notification),
            "error" => Some(MessageKind::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

/// A minimally parsed JSON-RPC 2.0 message.
///
/// Field order matters: serialization emits `jsonrpc`, `id`, `method`,
/// `params`, `result`, `error` in that order, which is the conventional wire
/// layout for synthesized responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub jsonrpc: String,
    /// Verbatim `id` fragment. `None` means the field was absent; a JSON
    /// `null` id is preserved as `Some("null")`.
    #[serde(
        default,
        deserialize_with = "raw_fragment",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Capture any present JSON value — including `null` — as a raw fragment.
///
/// Plain `Option<Box<RawValue>>` would fold `"id": null` into `None`, erasing
/// the distinction between an absent id and a null one.
fn raw_fragment<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

impl JsonRpcMessage {
    /// Classify this message by field presence.
    ///
    /// `method` + `id` → request; `method` without `id` → notification;
    /// an `error` object → error; everything else → response.
    pub fn kind(&self) -> MessageKind {
        let has_method = self.method.as_deref().is_some_and(|m| !m.is_empty());
        if has_method && self.id.is_some() {
            MessageKind::Request
        } else if has_method {
            MessageKind::Notification
        } else if self.error.is_some() {
            MessageKind::Error
        } else {
            MessageKind::Response
        }
    }

    /// The method name, or `""` when absent.
    pub fn method_str(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    /// The verbatim id fragment as a string, or `""` when absent.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().map(RawValue::get).unwrap_or("")
    }
}

/// Parse raw bytes as a JSON-RPC 2.0 message.
///
/// Never fails: any structural failure (invalid UTF-8, malformed JSON, or a
/// non-object payload such as a batch array) yields a zeroed message plus the
/// error text. Callers forward unparseable lines verbatim to preserve
/// connection integrity.
pub fn parse(raw: &[u8]) -> (JsonRpcMessage, Option<String>) {
    let text = match std::str::from_utf8(raw) {
        Ok(t) => t,
        Err(e) => return (JsonRpcMessage::default(), Some(e.to_string())),
    };
    if !text.trim_start().starts_with('{') {
        return (
            JsonRpcMessage::default(),
            Some("message is not a JSON object".to_string()),
        );
    }
    match serde_json::from_str::<JsonRpcMessage>(text) {
        Ok(msg) => (msg, None),
        Err(e) => (JsonRpcMessage::default(), Some(e.to_string())),
    }
}

/// Build a serialized JSON-RPC error response for the given request id.
///
/// The id fragment is echoed verbatim. When `id` is `None` the field is
/// omitted entirely (callers should not answer id-less messages at all).
pub fn error_response(id: Option<&RawValue>, code: i64, message: &str) -> Vec<u8> {
    let msg = JsonRpcMessage {
        jsonrpc: "2.0".to_string(),
        id: id.map(ToOwned::to_owned),
        error: Some(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
        ..Default::default()
    };
    serde_json::to_vec(&msg).unwrap_or_default()
}
