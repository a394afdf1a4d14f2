//! The wire unit: every WebSocket text frame carries one envelope.
//!
//! Requests carry `type` + `id` + `op` + `payload`; responses echo the
//! `id`; server-originated events carry `type` + `data` and omit `id`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

/// Keys an envelope may legally carry. Strict mode rejects anything else;
/// permissive mode warns and ignores.
const KNOWN_KEYS: &[&str] = &["type", "id", "op", "payload", "data", "error", "timestamp"];

impl Envelope {
    pub fn event(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: None,
            op: None,
            payload: None,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Streamed frame that still belongs to a request (echoes its `id`).
    pub fn stream(kind: &str, id: &str, data: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::event(kind, data)
        }
    }

    pub fn response(kind: &str, id: &str, data: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::event(kind, data)
        }
    }

    pub fn error_frame(kind: &str, id: Option<&str>, error: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.map(str::to_string),
            op: None,
            payload: None,
            data: None,
            error: Some(error.to_string()),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Request body — clients may send either `payload` or `data`.
    pub fn body(&self) -> Value {
        self.payload
            .clone()
            .or_else(|| self.data.clone())
            .unwrap_or(Value::Null)
    }

    /// The operation name, or a `Malformed` error when absent.
    pub fn op_name(&self) -> anyhow::Result<&str> {
        self.op
            .as_deref()
            .ok_or_else(|| ServiceError::Malformed("missing op".into()).into())
    }
}

/// Parse a text frame into an envelope.
///
/// `strict` rejects unknown top-level keys; otherwise they are logged and
/// dropped. A missing or non-string `type` is malformed either way.
pub fn parse_envelope(text: &str, strict: bool) -> Result<Envelope, ServiceError> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|e| ServiceError::Malformed(format!("invalid JSON: {e}")))?;

    let obj = raw
        .as_object()
        .ok_or_else(|| ServiceError::Malformed("envelope must be an object".into()))?;

    let unknown: Vec<&str> = obj
        .keys()
        .map(String::as_str)
        .filter(|k| !KNOWN_KEYS.contains(k))
        .collect();
    if !unknown.is_empty() {
        if strict {
            return Err(ServiceError::Malformed(format!(
                "unknown envelope keys: {}",
                unknown.join(", ")
            )));
        }
        tracing::warn!(keys = ?unknown, "ignoring unknown envelope keys");
    }

    if !obj.get("type").map(Value::is_string).unwrap_or(false) {
        return Err(ServiceError::Malformed("missing type".into()));
    }

    serde_json::from_value(raw).map_err(|e| ServiceError::Malformed(format!("bad envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_payload() {
        let env = parse_envelope(
            r#"{"type":"terminal","id":"r1","op":"create","payload":{"cols":80,"rows":24},"timestamp":0}"#,
            true,
        )
        .unwrap();
        assert_eq!(env.kind, "terminal");
        assert_eq!(env.id.as_deref(), Some("r1"));
        assert_eq!(env.op_name().unwrap(), "create");
        assert_eq!(env.body()["cols"], 80);
    }

    #[test]
    fn data_key_is_accepted_as_body() {
        let env =
            parse_envelope(r#"{"type":"git","id":"1","op":"status","data":{},"timestamp":0}"#, true)
                .unwrap();
        assert!(env.body().is_object());
    }

    #[test]
    fn missing_timestamp_is_malformed() {
        assert!(parse_envelope(r#"{"type":"git"}"#, true).is_err());
    }

    #[test]
    fn strict_rejects_unknown_keys() {
        let text = r#"{"type":"ping","timestamp":0,"extra":true}"#;
        assert!(parse_envelope(text, true).is_err());
        assert!(parse_envelope(text, false).is_ok());
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(parse_envelope(r#"{"id":"1","timestamp":0}"#, false).is_err());
    }

    #[test]
    fn events_omit_id_on_the_wire() {
        let frame = serde_json::to_string(&Envelope::event("agent_exit", Value::Null)).unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert!(v.get("id").is_none());
        assert!(v.get("error").is_none());
        assert!(v["timestamp"].is_i64());
    }
}
