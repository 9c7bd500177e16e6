use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::DeliveryError;

/// Classified failure carried by an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NoResults,
    QueryExecution,
    Persistence,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Validation => "validation",
            ErrorCode::NoResults => "no_results",
            ErrorCode::QueryExecution => "query_execution",
            ErrorCode::Persistence => "persistence",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Inbound query. `data` is the JSON filter payload, kept raw until the
/// handler parses it so a bad payload is answered rather than dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEvent {
    pub uuid: Uuid,
    pub aggregate_id: i16,
    pub correlation_id: Uuid,
    #[serde(default)]
    pub event_action: String,
    #[serde(default)]
    pub service_action: String,
    #[serde(alias = "filterPayload")]
    pub data: Box<RawValue>,
}

/// Outbound answer to exactly one [`QueryEvent`]. Identity fields are always
/// copied from the request so the caller can match it up.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub uuid: Uuid,
    pub aggregate_id: i16,
    pub correlation_id: Uuid,
    pub event_action: String,
    pub service_action: String,
    /// JSON array of report rows on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ResponseEvent {
    pub fn success(event: &QueryEvent, result: Box<RawValue>) -> Self {
        Self {
            result: Some(result),
            ..Self::answering(event)
        }
    }

    pub fn failure(event: &QueryEvent, code: ErrorCode, message: String) -> Self {
        Self {
            error: Some(message),
            error_code: Some(code),
            ..Self::answering(event)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code.is_none()
    }

    fn answering(event: &QueryEvent) -> Self {
        Self {
            uuid: event.uuid,
            aggregate_id: event.aggregate_id,
            correlation_id: event.correlation_id,
            event_action: event.event_action.clone(),
            service_action: event.service_action.clone(),
            result: None,
            error: None,
            error_code: None,
        }
    }
}

/// What the transport hands over: an event, or the reason it could not be read.
pub type Delivery = std::result::Result<QueryEvent, DeliveryError>;

pub fn decode_delivery(raw: &[u8]) -> Delivery {
    Ok(serde_json::from_slice(raw)?)
}

/// A delivery plus the channel its single response goes back on. Dropping
/// `reply` without sending is how a query is dropped.
#[derive(Debug)]
pub struct Envelope {
    pub delivery: Delivery,
    pub reply: oneshot::Sender<ResponseEvent>,
}

impl Envelope {
    pub fn new(delivery: Delivery) -> (Self, oneshot::Receiver<ResponseEvent>) {
        let (reply, rx) = oneshot::channel();
        (Self { delivery, reply }, rx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn query_event(aggregate_id: i16, data: &str) -> QueryEvent {
        QueryEvent {
            uuid: Uuid::new_v4(),
            aggregate_id,
            correlation_id: Uuid::new_v4(),
            event_action: "query".to_string(),
            service_action: "itemSoldFlashSaleReport".to_string(),
            data: RawValue::from_string(data.to_string()).unwrap(),
        }
    }

    #[test]
    fn decodes_event_with_raw_payload() {
        let raw = json!({
            "uuid": Uuid::new_v4(),
            "aggregateId": 14,
            "correlationId": Uuid::new_v4(),
            "eventAction": "query",
            "data": { "timestamp": { "$gt": 9, "$lt": 21 } }
        })
        .to_string();
        let event = decode_delivery(raw.as_bytes()).unwrap();
        assert_eq!(event.aggregate_id, 14);
        assert_eq!(event.data.get(), r#"{"timestamp":{"$gt":9,"$lt":21}}"#);
        assert_eq!(event.service_action, "");
    }

    #[test]
    fn payload_keeps_repeated_keys() {
        let raw = format!(
            r#"{{"uuid":"{}","aggregateId":14,"correlationId":"{}","filterPayload":{{"timestamp":{{"$gt":9}},"timestamp":{{"$lt":21}}}}}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let event = decode_delivery(raw.as_bytes()).unwrap();
        assert_eq!(event.data.get(), r#"{"timestamp":{"$gt":9},"timestamp":{"$lt":21}}"#);
    }

    #[test]
    fn envelope_without_correlation_is_undeliverable() {
        let raw = json!({ "uuid": Uuid::new_v4(), "aggregateId": 14, "data": {} }).to_string();
        assert!(matches!(decode_delivery(raw.as_bytes()), Err(DeliveryError::Malformed(_))));
        assert!(decode_delivery(b"not json").is_err());
    }

    #[test]
    fn failure_response_preserves_identity() {
        let event = query_event(14, "{}");
        let resp = ResponseEvent::failure(&event, ErrorCode::Validation, "bad".to_string());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["correlationId"], json!(event.correlation_id));
        assert_eq!(json["aggregateId"], json!(14));
        assert_eq!(json["errorCode"], json!("validation"));
        assert!(json.get("result").is_none());
        assert!(!resp.is_success());
    }
}
