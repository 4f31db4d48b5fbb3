//! Wire format of inbound events.
//!
//! An event is one JSON object. `timestamp` (RFC 3339 string or epoch
//! milliseconds) and `stream` are reserved top-level keys. When the object
//! carries a `payload` object that becomes the payload, and any other
//! top-level keys are merged into it unless the envelope already has them.
//! Otherwise the payload is everything except the reserved keys.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{value::RawValue, Map, Value};
use thiserror::Error;

use crate::Event;

const TIMESTAMP_KEY: &str = "timestamp";
const STREAM_KEY: &str = "stream";
const PAYLOAD_KEY: &str = "payload";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("event of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid json, {0}")]
    Json(#[from] serde_json::Error),
    #[error("event must be a json object, got {0}")]
    NotAnObject(&'static str),
    #[error("invalid timestamp, {0}")]
    Timestamp(String),
    #[error("stream must be a non-empty string")]
    Stream,
    #[error("batch holds no event")]
    EmptyBatch,
    #[error("batch element {index} is invalid, {source}")]
    BatchElement {
        index: usize,
        #[source]
        source: Box<ParseError>,
    },
}

#[derive(Deserialize, Debug, Clone, Copy)]
pub struct ParseLimits {
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_event_bytes: default_max_event_bytes(),
        }
    }
}

pub fn default_max_event_bytes() -> usize {
    64 * 1024
}

/// Decodes a single event.
pub fn decode_event(raw: &[u8], limits: &ParseLimits) -> Result<Event, ParseError> {
    let raw = trim(raw);
    if raw.is_empty() {
        return Err(ParseError::Empty);
    }
    if raw.len() > limits.max_event_bytes {
        return Err(ParseError::TooLarge {
            size: raw.len(),
            limit: limits.max_event_bytes,
        });
    }
    let value: Value = serde_json::from_slice(raw)?;
    event_from_value(value, Utc::now())
}

/// Decodes either a single event or a JSON array of events. The batch is
/// all-or-nothing: one malformed element rejects the whole input.
pub fn decode_batch(raw: &[u8], limits: &ParseLimits) -> Result<Vec<Event>, ParseError> {
    let trimmed = trim(raw);
    if !trimmed.starts_with(b"[") {
        return decode_event(trimmed, limits).map(|e| vec![e]);
    }
    let elements: Vec<&RawValue> = serde_json::from_slice(trimmed)?;
    if elements.is_empty() {
        return Err(ParseError::EmptyBatch);
    }
    let received_at = Utc::now();
    elements
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            decode_element(raw, limits, received_at).map_err(|e| ParseError::BatchElement {
                index,
                source: Box::new(e),
            })
        })
        .collect()
}

fn decode_element(
    raw: &RawValue,
    limits: &ParseLimits,
    received_at: DateTime<Utc>,
) -> Result<Event, ParseError> {
    let raw = raw.get();
    if raw.len() > limits.max_event_bytes {
        return Err(ParseError::TooLarge {
            size: raw.len(),
            limit: limits.max_event_bytes,
        });
    }
    event_from_value(serde_json::from_str(raw)?, received_at)
}

pub fn event_from_value(value: Value, received_at: DateTime<Utc>) -> Result<Event, ParseError> {
    let mut object = match value {
        Value::Object(object) => object,
        other => return Err(ParseError::NotAnObject(kind_name(&other))),
    };

    let timestamp = match object.remove(TIMESTAMP_KEY) {
        Some(ts) => parse_timestamp(&ts)?,
        None => received_at,
    };
    let stream = match object.remove(STREAM_KEY) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(_) => return Err(ParseError::Stream),
        None => None,
    };
    let payload = match object.remove(PAYLOAD_KEY) {
        Some(Value::Object(mut payload)) => {
            for (key, value) in object {
                payload.entry(key).or_insert(value);
            }
            payload
        }
        Some(other) => {
            // not an envelope, `payload` is an ordinary field
            object.insert(PAYLOAD_KEY.to_string(), other);
            object
        }
        None => object,
    };

    let mut event = Event::new(payload).with_timestamp(timestamp);
    event.meta.received_at = received_at;
    event.meta.stream = stream;
    Ok(event)
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ParseError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| ParseError::Timestamp(format!("{s:?} is not rfc3339, {e}"))),
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .ok_or_else(|| ParseError::Timestamp(format!("{n} is not an integer")))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ParseError::Timestamp(format!("{millis} is out of range")))
        }
        other => Err(ParseError::Timestamp(format!(
            "expected a string or a number, got {}",
            kind_name(other)
        ))),
    }
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn trim(raw: &[u8]) -> &[u8] {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    let end = raw
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &raw[start..end]
}

/// Convenience for building payloads in tests and plugins.
pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn limits() -> ParseLimits {
        ParseLimits::default()
    }

    #[test]
    fn decode_flat_object() {
        let event = decode_event(
            br#"{"stream":"web","timestamp":"2024-03-01T10:00:00Z","path":"/","ms":12}"#,
            &limits(),
        )
        .unwrap();
        assert_eq!(event.stream(), Some("web"));
        assert_eq!(event.timestamp.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(event.payload, object(json!({"path": "/", "ms": 12})));
        assert!(event.enrichment.is_empty());
    }

    #[test]
    fn decode_envelope_and_epoch_millis() {
        let event = decode_event(
            br#" {"timestamp":1700000000000,"payload":{"cpu":0.5}} "#,
            &limits(),
        )
        .unwrap();
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(event.payload, object(json!({"cpu": 0.5})));
        assert_eq!(event.stream(), None);
    }

    #[test]
    fn envelope_siblings_are_merged_into_the_payload() {
        let event = decode_event(
            br#"{"stream":"web","host":"x","cpu":0.1,"payload":{"cpu":0.5}}"#,
            &limits(),
        )
        .unwrap();
        assert_eq!(event.stream(), Some("web"));
        assert_eq!(event.payload, object(json!({"cpu": 0.5, "host": "x"})));
    }

    #[test]
    fn non_object_payload_key_is_a_plain_field() {
        let event = decode_event(br#"{"payload":"text"}"#, &limits()).unwrap();
        assert_eq!(event.payload, object(json!({"payload": "text"})));
    }

    #[test]
    fn missing_timestamp_defaults_to_receive_time() {
        let event = decode_event(br#"{"a":1}"#, &limits()).unwrap();
        assert_eq!(event.timestamp, event.meta.received_at);
    }

    #[test]
    fn reject_malformed_input() {
        assert!(matches!(decode_event(b"  \n", &limits()), Err(ParseError::Empty)));
        assert!(matches!(
            decode_event(b"{not json", &limits()),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            decode_event(b"[1,2]", &limits()),
            Err(ParseError::NotAnObject("array"))
        ));
        assert!(matches!(
            decode_event(br#"{"timestamp":"yesterday"}"#, &limits()),
            Err(ParseError::Timestamp(_))
        ));
        assert!(matches!(
            decode_event(br#"{"timestamp":true}"#, &limits()),
            Err(ParseError::Timestamp(_))
        ));
        assert!(matches!(
            decode_event(br#"{"stream":7}"#, &limits()),
            Err(ParseError::Stream)
        ));
        assert!(matches!(
            decode_event(br#"{"stream":""}"#, &limits()),
            Err(ParseError::Stream)
        ));
    }

    #[test]
    fn reject_oversized_event() {
        let limits = ParseLimits { max_event_bytes: 8 };
        let err = decode_event(br#"{"long":"value"}"#, &limits).unwrap_err();
        assert!(matches!(err, ParseError::TooLarge { size: 16, limit: 8 }));
    }

    #[test]
    fn decode_batches() {
        let events = decode_batch(br#"[{"a":1},{"stream":"s","b":2}]"#, &limits()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].stream(), Some("s"));

        let single = decode_batch(br#"{"a":1}"#, &limits()).unwrap();
        assert_eq!(single.len(), 1);

        assert!(matches!(
            decode_batch(b"[]", &limits()),
            Err(ParseError::EmptyBatch)
        ));
        let err = decode_batch(br#"[{"a":1}, 3]"#, &limits()).unwrap_err();
        assert!(matches!(err, ParseError::BatchElement { index: 1, .. }));
        assert!(matches!(decode_batch(b"[{", &limits()), Err(ParseError::Json(_))));
    }

    #[test]
    fn oversized_element_rejects_the_batch() {
        let limits = ParseLimits { max_event_bytes: 16 };
        let long = format!(r#"{{"long":"{}"}}"#, "a".repeat(32));
        assert!(matches!(
            decode_event(long.as_bytes(), &limits),
            Err(ParseError::TooLarge { .. })
        ));

        let batch = format!(r#"[{{"a":1}}, {long}]"#);
        let err = decode_batch(batch.as_bytes(), &limits).unwrap_err();
        let ParseError::BatchElement { index, source } = err else {
            panic!("expected a batch element error");
        };
        assert_eq!(index, 1);
        assert!(matches!(*source, ParseError::TooLarge { size: 43, limit: 16 }));

        // small elements still fit even when the whole array is larger
        let events = decode_batch(br#"[{"a":1},{"b":2},{"c":3}]"#, &limits).unwrap();
        assert_eq!(events.len(), 3);
    }
}
