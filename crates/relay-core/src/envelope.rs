//! Inbound message envelope parsing.
//!
//! A broker message body is a JSON object. Four fields are recognized and the
//! rest pass through untouched as the forwarded payload:
//!
//! | field               | type            | use                              |
//! |---------------------|-----------------|----------------------------------|
//! | `httpRequest`       | string or null  | outbound verb, stripped          |
//! | `urlSuffix`         | string or null  | appended to base URL, stripped   |
//! | `deviceMessageType` | integer or null | event class for routing          |
//! | `updateDate`        | string          | event time for debounce windows  |
//!
//! A timestamp that is missing or cannot be parsed becomes the minimum
//! representable time, so any dated message of the same class supersedes it.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    error::{EnvelopeError, Result},
    models::{DeliveryTag, DeviceEventType, PendingMessage},
};

/// Envelope field holding the outbound HTTP verb.
pub const HTTP_REQUEST_FIELD: &str = "httpRequest";
/// Envelope field holding the URL suffix.
pub const URL_SUFFIX_FIELD: &str = "urlSuffix";
/// Envelope field holding the device event class code.
pub const DEVICE_MESSAGE_TYPE_FIELD: &str = "deviceMessageType";
/// Envelope field holding the event timestamp.
pub const UPDATE_DATE_FIELD: &str = "updateDate";

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parsed message body with routing fields separated from the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Raw `httpRequest` value.
    pub http_method: Option<String>,
    /// Raw `urlSuffix` value.
    pub url_suffix: Option<String>,
    /// Event class; absent field means `Confirmed`, unknown codes are `None`.
    pub event_type: Option<DeviceEventType>,
    /// Event time in UTC.
    pub event_timestamp: DateTime<Utc>,
    /// Remaining fields, forwarded as the HTTP body.
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Parses a raw message body.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError` if the body is not a JSON object, or a
    /// recognized routing or classification field has the wrong type.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| EnvelopeError::invalid_json(e.to_string()))?;

        let mut payload = match value {
            Value::Object(map) => map,
            other => return Err(EnvelopeError::NotAnObject { found: json_type(&other) }),
        };

        let event_type = match payload.get(DEVICE_MESSAGE_TYPE_FIELD) {
            None | Some(Value::Null) => Some(DeviceEventType::Confirmed),
            Some(Value::Number(number)) => {
                let code = number.as_i64().ok_or_else(|| {
                    EnvelopeError::field_type(DEVICE_MESSAGE_TYPE_FIELD, "an integer", "number")
                })?;
                DeviceEventType::from_code(code)
            },
            Some(other) => {
                return Err(EnvelopeError::field_type(
                    DEVICE_MESSAGE_TYPE_FIELD,
                    "an integer",
                    json_type(other),
                ))
            },
        };

        let event_timestamp = payload
            .get(UPDATE_DATE_FIELD)
            .and_then(Value::as_str)
            .map_or(DateTime::<Utc>::MIN_UTC, parse_timestamp);

        let http_method = take_optional_string(&mut payload, HTTP_REQUEST_FIELD)?;
        let url_suffix = take_optional_string(&mut payload, URL_SUFFIX_FIELD)?;

        Ok(Self { http_method, url_suffix, event_type, event_timestamp, payload })
    }

    /// Attaches broker metadata and produces the pipeline work item.
    pub fn into_pending(
        self,
        delivery_tag: DeliveryTag,
        raw_body: Bytes,
        attempt: u32,
    ) -> PendingMessage {
        PendingMessage {
            delivery_tag,
            raw_body,
            attempt,
            http_method: self.http_method,
            url_suffix: self.url_suffix,
            payload: self.payload,
            event_timestamp: self.event_timestamp,
            event_type: self.event_type,
        }
    }
}

/// Parses an ISO-8601 style timestamp into UTC.
///
/// Values with an offset are converted; values without one are taken as UTC.
/// Anything unparsable yields `DateTime::<Utc>::MIN_UTC`.
pub fn parse_timestamp(input: &str) -> DateTime<Utc> {
    let input = input.trim();
    if input.is_empty() {
        return DateTime::<Utc>::MIN_UTC;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(parsed) = DateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return parsed.with_timezone(&Utc);
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(input, format) {
            return parsed.and_utc();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return midnight.and_utc();
        }
    }

    DateTime::<Utc>::MIN_UTC
}

fn take_optional_string(payload: &mut Map<String, Value>, field: &'static str) -> Result<Option<String>> {
    match payload.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(EnvelopeError::field_type(field, "a string", json_type(&other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
