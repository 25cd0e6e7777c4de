//! # Message Codec
//!
//! Bodies are JSON. The payload type travels in the `model_class` header,
//! never in the body, so a reply body is the bare payload:
//!
//! ```text
//! model_class     body
//! ─────────────   ─────────────────────────────────────────────
//! Operation       {"operation_type": "...", "target_garden_name": ..., "args": [...], "kwargs": {...}}
//! Event           {"garden": "...", "timestamp": "...", "payload": {"name": "USER_UPDATED", ...}}
//! error_message   {"error_type": "ValidationError", "message": "..."}
//! <anything else> the response payload, empty for "no payload"
//! ```

use serde_json::Value;

use garden_core::{
    ErrorMessage, GardenEvent, Operation, Outcome, Response, MODEL_CLASS_ERROR, MODEL_CLASS_EVENT,
};

use crate::error::{SyncError, SyncResult};
use crate::transport::{Headers, HEADER_CORRELATION_ID, HEADER_MODEL_CLASS};

/// Sender identity header.
pub const HEADER_GARDEN_NAME: &str = "garden_name";

// =============================================================================
// Operations
// =============================================================================

/// Parses an inbound operation body.
pub fn decode_operation(body: &str) -> SyncResult<Operation> {
    let operation: Operation = serde_json::from_str(body)
        .map_err(|e| SyncError::Parse(format!("Malformed operation: {}", e)))?;

    if operation.operation_type().is_empty() {
        return Err(SyncError::Parse("Operation has no operation_type".into()));
    }
    Ok(operation)
}

pub fn encode_operation(operation: &Operation) -> SyncResult<String> {
    Ok(serde_json::to_string(operation)?)
}

// =============================================================================
// Outcomes
// =============================================================================

/// Serializes a result or a failure. The model class goes in the headers.
pub fn encode_outcome(outcome: &Outcome) -> SyncResult<String> {
    match outcome {
        Outcome::Success(response) if response.is_empty() => Ok(String::new()),
        Outcome::Success(response) => Ok(serde_json::to_string(&response.payload)?),
        Outcome::Failure(error) => Ok(serde_json::to_string(error)?),
    }
}

/// Rebuilds an outcome from a reply's model class and body.
pub fn decode_outcome(model_class: &str, body: &str) -> SyncResult<Outcome> {
    if model_class == MODEL_CLASS_ERROR {
        let error: ErrorMessage = serde_json::from_str(body)
            .map_err(|e| SyncError::Parse(format!("Malformed error reply: {}", e)))?;
        return Ok(Outcome::Failure(error));
    }

    let payload = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body)
            .map_err(|e| SyncError::Parse(format!("Malformed {} reply: {}", model_class, e)))?
    };

    Ok(Outcome::Success(Response::new(model_class, payload)))
}

// =============================================================================
// Events
// =============================================================================

pub fn encode_event(event: &GardenEvent) -> SyncResult<String> {
    Ok(serde_json::to_string(event)?)
}

pub fn decode_event(body: &str) -> SyncResult<GardenEvent> {
    serde_json::from_str(body).map_err(|e| SyncError::Parse(format!("Malformed event: {}", e)))
}

// =============================================================================
// Header Envelope
// =============================================================================

/// Identity headers this garden stamps on everything it sends.
pub fn garden_headers(garden_name: &str) -> Headers {
    Headers::from([(HEADER_GARDEN_NAME.to_string(), garden_name.to_string())])
}

/// Headers announcing a payload type.
pub fn model_class_headers(model_class: &str) -> Headers {
    Headers::from([(HEADER_MODEL_CLASS.to_string(), model_class.to_string())])
}

pub fn event_headers(garden_name: &str) -> Headers {
    build_headers(
        &model_class_headers(MODEL_CLASS_EVENT),
        &Headers::new(),
        &garden_headers(garden_name),
    )
}

/// Merges the header layers of an outbound message.
///
/// Garden identity goes in first and the response headers on top, so the
/// payload type always comes from `response_headers`. From the request only
/// the correlation id is carried over, which lets the requester match the
/// reply. Transport headers of the request (destination, message-id,
/// subscription, reply-to) never leak into the reply.
pub fn build_headers(
    response_headers: &Headers,
    request_headers: &Headers,
    garden_headers: &Headers,
) -> Headers {
    let mut headers = garden_headers.clone();
    headers.extend(
        response_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    if let Some(correlation_id) = request_headers.get(HEADER_CORRELATION_ID) {
        headers.insert(HEADER_CORRELATION_ID.to_string(), correlation_id.clone());
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use garden_core::{ErrorKind, OperationKind, User, MODEL_CLASS_OPERATION};
    use serde_json::json;

    #[test]
    fn test_decode_operation() {
        let body = r#"{"operation_type":"JOB_PAUSE","target_garden_name":"child","kwargs":{"job_id":"abc","wait_timeout":5}}"#;
        let op = decode_operation(body).unwrap();

        assert_eq!(op.kind().unwrap(), OperationKind::JobPause);
        assert_eq!(op.target_garden_name(), Some("child"));
        assert_eq!(op.str_param("job_id"), Some("abc"));
    }

    #[test]
    fn test_decode_operation_failures_are_parse_errors() {
        for body in ["not json", "{}", r#"{"operation_type":""}"#, r#"{"operation_type":3}"#] {
            let err = decode_operation(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse, "body: {}", body);
        }
    }

    #[test]
    fn test_unknown_operation_type_still_decodes() {
        // routing decides what is unknown, not the codec
        let op = decode_operation(r#"{"operation_type":"BREW_COFFEE"}"#).unwrap();
        assert!(op.kind().is_err());
    }

    #[test]
    fn test_encode_outcome() {
        let success = Outcome::Success(Response::new("Job", json!({"id": "1"})));
        assert_eq!(encode_outcome(&success).unwrap(), r#"{"id":"1"}"#);

        let empty = Outcome::Success(Response::ack());
        assert_eq!(encode_outcome(&empty).unwrap(), "");

        let failure = Outcome::Failure(ErrorMessage::new(ErrorKind::Routing, "no such garden"));
        let body = encode_outcome(&failure).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({"error_type": "RoutingError", "message": "no such garden"})
        );
    }

    #[test]
    fn test_decode_outcome() {
        let failure = decode_outcome(
            MODEL_CLASS_ERROR,
            r#"{"error_type":"ValidationError","message":"Unsupported path value '/name'"}"#,
        )
        .unwrap();
        assert_eq!(
            failure,
            Outcome::Failure(ErrorMessage::new(
                ErrorKind::Validation,
                "Unsupported path value '/name'"
            ))
        );

        let empty = decode_outcome("Ack", "").unwrap();
        assert_eq!(empty, Outcome::Success(Response::new("Ack", Value::Null)));

        assert!(decode_outcome(MODEL_CLASS_ERROR, "oops").is_err());
    }

    #[test]
    fn test_outcome_survives_the_wire() {
        let mut outcomes = vec![
            Outcome::Success(Response::new("Job", json!([{"id": "1", "status": "RUNNING"}]))),
            Outcome::Success(Response::ack()),
        ];
        outcomes.extend(
            [
                ErrorKind::Parse,
                ErrorKind::Validation,
                ErrorKind::Routing,
                ErrorKind::RemoteUnreachable,
                ErrorKind::Backend,
                ErrorKind::Internal,
            ]
            .into_iter()
            .map(|kind| Outcome::Failure(ErrorMessage::new(kind, "it broke"))),
        );

        for outcome in outcomes {
            let body = encode_outcome(&outcome).unwrap();
            let decoded = decode_outcome(outcome.model_class(), &body).unwrap();
            assert_eq!(decoded, outcome);
        }
    }

    #[test]
    fn test_event_round_trip() {
        let event = GardenEvent::user_updated("child", User::new("ada").to_synced());
        let decoded = decode_event(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert!(decode_event(r#"{"garden":"x"}"#).is_err());
    }

    #[test]
    fn test_build_headers_precedence() {
        let request = Headers::from([
            (HEADER_CORRELATION_ID.to_string(), "c-1".to_string()),
            ("reply-to".to_string(), "child.replies".to_string()),
            (HEADER_MODEL_CLASS.to_string(), MODEL_CLASS_OPERATION.to_string()),
            ("message-id".to_string(), "m-9".to_string()),
        ]);
        let mut garden = garden_headers("parent");
        garden.insert(HEADER_MODEL_CLASS.to_string(), "stale".to_string());

        let headers = build_headers(&model_class_headers("Job"), &request, &garden);

        assert_eq!(headers.get(HEADER_MODEL_CLASS).map(String::as_str), Some("Job"));
        assert_eq!(headers.get(HEADER_CORRELATION_ID).map(String::as_str), Some("c-1"));
        assert_eq!(headers.get(HEADER_GARDEN_NAME).map(String::as_str), Some("parent"));
        assert!(!headers.contains_key("reply-to"));
        assert!(!headers.contains_key("message-id"));
    }

    #[test]
    fn test_event_headers() {
        let headers = event_headers("child");
        assert_eq!(headers.get(HEADER_MODEL_CLASS).map(String::as_str), Some(MODEL_CLASS_EVENT));
        assert!(!headers.contains_key(HEADER_CORRELATION_ID));
    }
}
