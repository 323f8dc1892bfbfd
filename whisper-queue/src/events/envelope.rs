//! Event envelope wire format.
//!
//! ```json
//! { "job_id": "abc123",
//!   "event_type": "job_completed",
//!   "timestamp": "2025-04-19T00:00:00Z",
//!   "error_message": null }
//! ```
//!
//! Two historical publishers used different event-type names; both dialects
//! are accepted on input. Envelopes built here always carry the current
//! names.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Current wire name for a successful terminal event.
pub const EVENT_JOB_COMPLETED: &str = "job_completed";

/// Current wire name for a failed terminal event.
pub const EVENT_JOB_FAILED: &str = "job_failed";

/// Wire name announcing a freshly enqueued job.
pub const EVENT_NEW_JOB: &str = "new_job";

/// The event envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub job_id: String,
    pub event_type: String,
    pub timestamp: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl EventEnvelope {
    fn new(job_id: impl Into<String>, event_type: &str, error_message: Option<String>) -> Self {
        Self {
            job_id: job_id.into(),
            event_type: event_type.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            error_message,
        }
    }

    /// Envelope for a successful terminal event.
    pub fn completed(job_id: impl Into<String>) -> Self {
        Self::new(job_id, EVENT_JOB_COMPLETED, None)
    }

    /// Envelope for a failed terminal event.
    pub fn failed(job_id: impl Into<String>, error_message: Option<String>) -> Self {
        Self::new(job_id, EVENT_JOB_FAILED, error_message)
    }

    /// Envelope announcing a freshly enqueued job.
    pub fn new_job(job_id: impl Into<String>) -> Self {
        Self::new(job_id, EVENT_NEW_JOB, None)
    }

    /// The typed event this envelope carries.
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }
}

/// Typed event kinds, collapsing the historical naming dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Worker reported success (`job_completed`, legacy `batch_complete`).
    Completed,
    /// Worker reported failure (`job_failed`, legacy `batch_failed`).
    Failed,
    /// A job was enqueued upstream (`new_job`).
    NewJob,
    /// Upstream canceled a queued job (`cancel_job`, `job_canceled`).
    Canceled,
    /// Anything else; logged and dropped.
    Unknown,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "job_completed" | "batch_complete" => Self::Completed,
            "job_failed" | "batch_failed" => Self::Failed,
            "new_job" => Self::NewJob,
            "cancel_job" | "job_canceled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }
}

/// Base64 payload for a pub/sub message carrying this envelope.
pub fn encode_message_data(envelope: &EventEnvelope) -> Result<String> {
    Ok(BASE64.encode(serde_json::to_vec(envelope)?))
}

/// Decode an inbound delivery body into an envelope.
///
/// Accepts either a bare envelope or the push wrapper
/// `{"message": {"data": <payload>}}` where the payload is base64-encoded
/// JSON, plain JSON (emulator deliveries), or the legacy double-encoded
/// variant (a JSON string holding base64).
pub fn decode_delivery(body: &[u8]) -> Result<EventEnvelope> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::validation(format!("malformed delivery body: {}", e)))?;

    let envelope_value = match value.get("message").and_then(|m| m.get("data")) {
        Some(data) => {
            let data = data
                .as_str()
                .ok_or_else(|| Error::validation("push message data is not a string"))?;
            decode_message_data(data)?
        }
        None => value,
    };

    let envelope: EventEnvelope = serde_json::from_value(envelope_value)
        .map_err(|e| Error::validation(format!("malformed event envelope: {}", e)))?;

    if envelope.job_id.is_empty() {
        return Err(Error::validation("event envelope missing job_id"));
    }
    if envelope.event_type.is_empty() {
        return Err(Error::validation("event envelope missing event_type"));
    }
    if envelope.timestamp.is_empty() {
        return Err(Error::validation("event envelope missing timestamp"));
    }

    Ok(envelope)
}

fn decode_message_data(data: &str) -> Result<Value> {
    // Emulator deliveries put plain JSON into the data field; production
    // deliveries base64-encode it.
    let parsed: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            let bytes = BASE64
                .decode(data.trim())
                .map_err(|e| Error::validation(format!("message data is neither JSON nor base64: {}", e)))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::validation(format!("malformed message payload: {}", e)))?
        }
    };

    // Legacy publishers wrapped the envelope once more: a JSON string whose
    // content is base64 of the actual envelope.
    if let Value::String(inner) = parsed {
        let bytes = BASE64
            .decode(inner.trim())
            .map_err(|e| Error::validation(format!("malformed double-encoded payload: {}", e)))?;
        return serde_json::from_slice(&bytes)
            .map_err(|e| Error::validation(format!("malformed inner envelope: {}", e)));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_accepts_both_dialects() {
        assert_eq!(EventKind::from_type("job_completed"), EventKind::Completed);
        assert_eq!(EventKind::from_type("batch_complete"), EventKind::Completed);
        assert_eq!(EventKind::from_type("job_failed"), EventKind::Failed);
        assert_eq!(EventKind::from_type("batch_failed"), EventKind::Failed);
        assert_eq!(EventKind::from_type("new_job"), EventKind::NewJob);
        assert_eq!(EventKind::from_type("cancel_job"), EventKind::Canceled);
        assert_eq!(EventKind::from_type("job_canceled"), EventKind::Canceled);
        assert_eq!(EventKind::from_type("resize_job"), EventKind::Unknown);
    }

    #[test]
    fn test_constructors_emit_current_names() {
        assert_eq!(EventEnvelope::completed("j1").event_type, "job_completed");
        assert_eq!(
            EventEnvelope::failed("j1", Some("boom".to_string())).event_type,
            "job_failed"
        );
        assert_eq!(EventEnvelope::new_job("j1").event_type, "new_job");
    }

    #[test]
    fn test_envelope_serializes_null_error_message() {
        let envelope = EventEnvelope::completed("j1");
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("error_message").unwrap().is_null());
    }

    #[test]
    fn test_decode_bare_envelope() {
        let body = br#"{"job_id":"abc123","event_type":"job_completed","timestamp":"2025-04-19T00:00:00Z","error_message":null}"#;
        let envelope = decode_delivery(body).unwrap();
        assert_eq!(envelope.job_id, "abc123");
        assert_eq!(envelope.kind(), EventKind::Completed);
    }

    #[test]
    fn test_decode_push_wrapper_base64() {
        let envelope = EventEnvelope::failed("j9", Some("gpu preempted".to_string()));
        let data = encode_message_data(&envelope).unwrap();
        let body = serde_json::json!({ "message": { "data": data } });

        let decoded = decode_delivery(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_push_wrapper_plain_json() {
        let body = serde_json::json!({
            "message": {
                "data": r#"{"job_id":"j2","event_type":"batch_complete","timestamp":"2025-04-19T00:00:00Z"}"#
            }
        });
        let decoded = decode_delivery(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(decoded.job_id, "j2");
        assert_eq!(decoded.kind(), EventKind::Completed);
        assert_eq!(decoded.error_message, None);
    }

    #[test]
    fn test_decode_double_encoded_payload() {
        let envelope = EventEnvelope::completed("j3");
        let inner = encode_message_data(&envelope).unwrap();
        // data is a JSON string whose content is base64 of the envelope
        let data = serde_json::to_string(&inner).unwrap();
        let body = serde_json::json!({ "message": { "data": data } });

        let decoded = decode_delivery(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_rejects_missing_job_id() {
        let body = br#"{"job_id":"","event_type":"job_completed","timestamp":"2025-04-19T00:00:00Z"}"#;
        let err = decode_delivery(body).unwrap_err();
        assert!(err.to_string().contains("job_id"));

        let body = br#"{"event_type":"job_completed","timestamp":"2025-04-19T00:00:00Z"}"#;
        assert!(decode_delivery(body).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_delivery(b"not json").is_err());
        assert!(decode_delivery(br#"{"message":{"data":"!!!"}}"#).is_err());
    }
}
