//! JSON-RPC 2.0 framing shared by every transport driver.
//!
//! A [`Framer`] is owned by exactly one driver. It assigns monotonically
//! increasing request ids, serializes requests/notifications, and decodes
//! incoming envelopes into one of [`Incoming`]'s three shapes. It does not
//! move bytes itself — that's the transport's job — it only knows the wire
//! shape.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::McpError;

/// Correlation id for one outstanding JSON-RPC call. Driver-scoped, starts
/// at 1, strictly increasing for the lifetime of one driver session.
pub type RequestId = u64;

/// The MCP protocol version this client speaks during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error object, `{code, message, data?}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A decoded JSON-RPC response: either a result or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result(Value),
    Error(RpcError),
}

/// Anything that can arrive on the wire, classified
#[derive(Debug, Clone)]
pub enum Incoming {
    /// `{id, result}` or `{id, error}` — routed to the waiter for `id`.
    Response { id: RequestId, response: Response },
    /// `{method}` with no `id` — a server notification. The core only logs
    /// these (no server→client calls are implemented).
    Notification { method: String, params: Value },
    /// `{id, method}` — a server-initiated request. We have none to serve;
    /// callers reply with `{error.code: -32601}`.
    ServerRequest { id: Value, method: String },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Owns request-id allocation and wire (de)serialization for one driver.
#[derive(Debug, Default)]
pub struct Framer {
    next_id: AtomicU64,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next request id. Strictly increasing for this driver's
    /// lifetime (spec invariant 3); ids may be reused only after their
    /// waiter has been retired.
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Build a JSON-RPC request envelope, returning the assigned id and the
    /// serialized bytes (one line, newline appended by the transport).
    pub fn build_request(&self, method: &str, params: Value) -> (RequestId, String) {
        let id = self.next_id();
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        (id, message.to_string())
    }

    /// Build a JSON-RPC notification envelope (no `id`, no reply expected).
    pub fn build_notification(&self, method: &str, params: Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
        .to_string()
    }

    /// Build the canned "method not supported" error reply the core sends
    /// back for any server-initiated request.
    pub fn method_not_supported_reply(id: &Value) -> String {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "method not supported" },
        })
        .to_string()
    }

    /// Decode one line of wire bytes into a classified envelope.
    ///
    /// Unknown/malformed ids are reported as an error for the caller to log
    /// and discard; they never fail the connection.
    pub fn decode(line: &str) -> Result<Incoming, McpError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|err| McpError::Protocol {
                id: String::new(),
                message: format!("malformed JSON-RPC envelope: {err}"),
            })?;
        Self::decode_value(value)
    }

    pub fn decode_value(value: Value) -> Result<Incoming, McpError> {
        let raw: RawEnvelope = serde_json::from_value(value).map_err(|err| McpError::Protocol {
            id: String::new(),
            message: format!("malformed JSON-RPC envelope: {err}"),
        })?;

        match (raw.id, raw.method) {
            (Some(id), None) => {
                let numeric_id = parse_request_id(&id).ok_or_else(|| McpError::Protocol {
                    id: String::new(),
                    message: "response envelope had a non-numeric id".to_string(),
                })?;
                let response = match (raw.result, raw.error) {
                    (_, Some(error)) => Response::Error(error),
                    (Some(result), None) => Response::Result(result),
                    (None, None) => {
                        return Err(McpError::Protocol {
                            id: String::new(),
                            message: "response missing both result and error".to_string(),
                        })
                    }
                };
                Ok(Incoming::Response {
                    id: numeric_id,
                    response,
                })
            }
            (Some(id), Some(method)) => Ok(Incoming::ServerRequest { id, method }),
            (None, Some(method)) => Ok(Incoming::Notification {
                method,
                params: raw.params,
            }),
            (None, None) => Err(McpError::Protocol {
                id: String::new(),
                message: "envelope had neither id nor method".to_string(),
            }),
        }
    }
}

fn parse_request_id(value: &Value) -> Option<RequestId> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<RequestId>().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_starting_at_one() {
        let framer = Framer::new();
        let (id1, _) = framer.build_request("tools/list", Value::Null);
        let (id2, _) = framer.build_request("tools/list", Value::Null);
        let (id3, _) = framer.build_request("tools/list", Value::Null);
        assert_eq!((id1, id2, id3), (1, 2, 3));
    }

    #[test]
    fn request_envelope_has_literal_jsonrpc_version() {
        let framer = Framer::new();
        let (_, bytes) = framer.build_request("initialize", json!({"a": 1}));
        let value: Value = serde_json::from_str(&bytes).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "initialize");
    }

    #[test]
    fn notification_envelope_has_no_id() {
        let framer = Framer::new();
        let bytes = framer.build_notification("notifications/initialized", Value::Null);
        let value: Value = serde_json::from_str(&bytes).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn decode_routes_response_by_id() {
        let decoded = Framer::decode(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#).unwrap();
        match decoded {
            Incoming::Response { id, response } => {
                assert_eq!(id, 7);
                assert_eq!(response, Response::Result(json!({"ok": true})));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn decode_routes_error_response() {
        let decoded =
            Framer::decode(r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32000,"message":"nope"}}"#)
                .unwrap();
        match decoded {
            Incoming::Response {
                id,
                response: Response::Error(err),
            } => {
                assert_eq!(id, 7);
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "nope");
            }
            other => panic!("expected error Response, got {other:?}"),
        }
    }

    #[test]
    fn decode_classifies_notification_without_id() {
        let decoded =
            Framer::decode(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#)
                .unwrap();
        match decoded {
            Incoming::Notification { method, .. } => assert_eq!(method, "notifications/progress"),
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    #[test]
    fn decode_classifies_server_initiated_request() {
        let decoded =
            Framer::decode(r#"{"jsonrpc":"2.0","id":3,"method":"sampling/createMessage"}"#)
                .unwrap();
        match decoded {
            Incoming::ServerRequest { method, .. } => {
                assert_eq!(method, "sampling/createMessage")
            }
            other => panic!("expected ServerRequest, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_envelope_missing_result_and_error() {
        let err = Framer::decode(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, McpError::Protocol { .. }));
    }
}
