//! JSON-RPC envelope types and inbound frame classification.
//!
//! Inbound JSON is inherently dynamic; everything decodes into
//! `serde_json::Value` and is classified into a small tagged set:
//! heartbeat traffic, correlated replies, and everything else as events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version string carried on every outbound envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: the wire allows both integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(u64),
    Text(String),
}

impl RequestId {
    /// Extract an id from a JSON value (`1` or `"abc"`).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(RequestId::Num),
            Value::String(s) => Some(RequestId::Text(s.clone())),
            _ => None,
        }
    }

    /// Render as a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Num(n) => Value::from(*n),
            RequestId::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Num(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Num(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

/// Outbound JSON-RPC request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Create a notification (no id, no correlated reply).
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    /// Create a correlated request.
    pub fn call(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Subscribe to a single channel.
    pub fn subscribe(id: impl Into<RequestId>, channel: &str) -> Self {
        Self::call(
            id,
            "public/subscribe",
            serde_json::json!({ "channels": [channel] }),
        )
    }

    /// Unsubscribe from a single channel.
    pub fn unsubscribe(id: impl Into<RequestId>, channel: &str) -> Self {
        Self::call(
            id,
            "public/unsubscribe",
            serde_json::json!({ "channels": [channel] }),
        )
    }

    /// Heartbeat test response (answers a server `test_request`).
    pub fn heartbeat_reply() -> Self {
        Self::notification("public/test", serde_json::json!({}))
    }

    /// Arm server-side heartbeats at `interval_secs` (protocol floor 10s).
    pub fn set_heartbeat(id: impl Into<RequestId>, interval_secs: u64) -> Self {
        Self::call(
            id,
            "public/set_heartbeat",
            serde_json::json!({ "interval": interval_secs.max(10) }),
        )
    }
}

/// Heartbeat traffic recognized by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Server demands an immediate `public/test` reply.
    TestRequest,
    /// Plain liveness notification, no reply required.
    Notify,
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Heartbeat traffic, consumed by the heartbeat manager.
    Heartbeat(HeartbeatEvent),
    /// Reply bearing a known-shaped id; routed to the correlator.
    Reply { id: RequestId, body: Value },
    /// Everything else, delivered to the subscriber sink.
    Event { payload: Value },
}

/// Classify one decoded inbound message.
///
/// Heartbeats are checked first, then correlated replies (an `id` next to a
/// `result` or `error` member). Unknown shapes route as events.
pub fn classify(value: Value) -> Inbound {
    if value.get("method").and_then(Value::as_str) == Some("heartbeat") {
        let kind = value
            .get("params")
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        return match kind {
            Some("test_request") => Inbound::Heartbeat(HeartbeatEvent::TestRequest),
            _ => Inbound::Heartbeat(HeartbeatEvent::Notify),
        };
    }

    if value.get("result").is_some() || value.get("error").is_some() {
        if let Some(id) = value.get("id").and_then(RequestId::from_value) {
            return Inbound::Reply { id, body: value };
        }
    }

    Inbound::Event { payload: value }
}

/// Error payload of a reply, if it carries one.
pub fn reply_error(body: &Value) -> Option<String> {
    body.get("error").map(|e| {
        e.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_from_value() {
        assert_eq!(RequestId::from_value(&json!(7)), Some(RequestId::Num(7)));
        assert_eq!(
            RequestId::from_value(&json!("abc")),
            Some(RequestId::Text("abc".to_string()))
        );
        assert_eq!(RequestId::from_value(&json!(null)), None);
        assert_eq!(RequestId::from_value(&json!([1])), None);
    }

    #[test]
    fn test_call_serialization() {
        let req = RpcRequest::call(1u64, "public/test", json!({}));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 1);
        assert_eq!(v["method"], "public/test");
    }

    #[test]
    fn test_notification_omits_id() {
        let req = RpcRequest::heartbeat_reply();
        let v = serde_json::to_value(&req).unwrap();
        assert!(!v.as_object().unwrap().contains_key("id"));
        assert_eq!(v["method"], "public/test");
    }

    #[test]
    fn test_string_id_round_trip() {
        let req = RpcRequest::call("req-9", "private/buy", json!({"amount": 1}));
        let text = serde_json::to_string(&req).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back["id"], "req-9");
        match classify(json!({"id": "req-9", "result": "ok"})) {
            Inbound::Reply { id, .. } => assert_eq!(id, RequestId::Text("req-9".to_string())),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_test_request() {
        let msg = json!({"method": "heartbeat", "params": {"type": "test_request"}});
        assert_eq!(classify(msg), Inbound::Heartbeat(HeartbeatEvent::TestRequest));
    }

    #[test]
    fn test_classify_plain_heartbeat() {
        let msg = json!({"method": "heartbeat", "params": {}});
        assert_eq!(classify(msg), Inbound::Heartbeat(HeartbeatEvent::Notify));
    }

    #[test]
    fn test_classify_reply_recovers_id() {
        let msg = json!({"jsonrpc": "2.0", "id": 42, "result": {"ok": true}});
        match classify(msg) {
            Inbound::Reply { id, body } => {
                assert_eq!(id, RequestId::Num(42));
                assert_eq!(body["result"]["ok"], true);
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_reply() {
        let msg = json!({"id": 3, "error": {"code": -32000, "message": "bad params"}});
        match classify(msg) {
            Inbound::Reply { id, body } => {
                assert_eq!(id, RequestId::Num(3));
                assert_eq!(reply_error(&body), Some("bad params".to_string()));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_unknown_shape_is_event() {
        let msg = json!({"channel": "trades.BTC", "data": [1, 2, 3]});
        assert!(matches!(classify(msg), Inbound::Event { .. }));

        // An id without result/error is not a reply
        let msg = json!({"id": 5, "method": "subscription"});
        assert!(matches!(classify(msg), Inbound::Event { .. }));
    }

    #[test]
    fn test_reply_error_absent_on_success() {
        assert_eq!(reply_error(&json!({"id": 1, "result": "ok"})), None);
    }

    #[test]
    fn test_set_heartbeat_floors_interval() {
        let req = RpcRequest::set_heartbeat(1u64, 3);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["params"]["interval"], 10);
    }
}
