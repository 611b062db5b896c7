//! JSON-RPC 2.0 framing shared by both connectors.

use serde_json::{Value, json};

use crate::error::ConnectorError;

/// A frame received from a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        result: Result<Value, ConnectorError>,
    },
    Notification {
        subscription: String,
        result: Value,
    },
}

pub fn request_body(id: u64, method: &str, params: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Serialized request frame.
pub fn request(id: u64, method: &str, params: &Value) -> String {
    request_body(id, method, params).to_string()
}

/// Deduplication key for a wire subscription. `serde_json` keeps object keys
/// sorted, so equal params always render identically.
pub fn signature(method: &str, params: &Value) -> String {
    format!("{method}:{params}")
}

/// `state_subscribeStorage` → `state_unsubscribeStorage`.
pub fn unsubscribe_method(subscribe_method: &str) -> String {
    subscribe_method.replacen("_subscribe", "_unsubscribe", 1)
}

/// Subscription ids are strings on most nodes and numbers on some.
pub fn subscription_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The `result` of a response object, or its `error` as [`ConnectorError::Rpc`].
pub fn response_result(frame: &Value) -> Result<Value, ConnectorError> {
    if let Some(err) = frame.get("error") {
        return Err(ConnectorError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    frame
        .get("result")
        .cloned()
        .ok_or_else(|| ConnectorError::InvalidResponse("response without result".into()))
}

/// Classify a websocket text frame.
pub fn parse(text: &str) -> Result<Incoming, ConnectorError> {
    let frame: Value = serde_json::from_str(text)?;
    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        return Ok(Incoming::Response {
            id,
            result: response_result(&frame),
        });
    }
    if let Some(params) = frame.get("params") {
        let subscription = params
            .get("subscription")
            .and_then(subscription_id)
            .ok_or_else(|| ConnectorError::InvalidResponse("notification without subscription".into()))?;
        return Ok(Incoming::Notification {
            subscription,
            result: params.get("result").cloned().unwrap_or(Value::Null),
        });
    }
    Err(ConnectorError::InvalidResponse(format!(
        "unrecognised frame: {}",
        text.chars().take(120).collect::<String>()
    )))
}
