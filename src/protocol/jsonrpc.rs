//! JSON-RPC envelope helpers.
//!
//! The bridge never interprets JSON-RPC methods; it only needs to recognise
//! a payload, pull out its `id`, and format error responses addressed to
//! that id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code used for every bridge-originated failure ("Server error").
pub const SERVER_ERROR: i64 = -32000;

/// JSON-RPC protocol version string.
pub const VERSION: &str = "2.0";

/// Error object inside an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// A JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Id of the request this answers (`0` when none is known).
    pub id: Value,
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// The error.
    pub error: ErrorObject,
}

impl ErrorResponse {
    /// Build a server error response for `id`.
    pub fn new(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            jsonrpc: VERSION.to_string(),
            error: ErrorObject {
                code: SERVER_ERROR,
                message: message.into(),
            },
        }
    }

    /// Whether this error is tied to a specific request.
    ///
    /// Errors addressed to id `0` describe the session itself, e.g. a
    /// relay that could not be dialed. A `null` id is an ordinary relay
    /// answer (parse errors carry one) and is not session-level.
    pub fn is_session_level(&self) -> bool {
        matches!(&self.id, Value::Number(n) if n.as_i64() == Some(0))
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "jsonrpc": self.jsonrpc,
            "error": { "code": self.error.code, "message": self.error.message },
        })
    }
}

/// Format a JSON-RPC error response as a JSON string.
pub fn format_error(id: Value, message: &str) -> String {
    ErrorResponse::new(id, message).to_value().to_string()
}

/// Whether `value` looks like a JSON-RPC request, response, or error.
///
/// Requires an object with `"jsonrpc": "2.0"` and an `id` member.
pub fn is_payload(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| {
        obj.get("jsonrpc").and_then(Value::as_str) == Some(VERSION) && obj.contains_key("id")
    })
}

/// The `id` of a payload, or `0` when absent.
pub fn payload_id(value: &Value) -> Value {
    value.get("id").cloned().unwrap_or_else(|| Value::from(0))
}

/// Parse `value` as an error response if it carries an `error` member.
pub fn as_error(value: &Value) -> Option<ErrorResponse> {
    if value.get("error").is_none() {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}
