use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single unit of telemetry moving through the pipeline.
///
/// An event is owned by exactly one stage at a time: the ingestor creates it,
/// the queue and then a worker take it over, each plugin receives it by value
/// and hands it on, and the output only ever borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
    // fields derived by the pipeline and the plugins
    #[serde(default)]
    pub enrichment: Map<String, Value>,
    #[serde(flatten)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    // assigned on admission into a pipeline, 0 before that
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now,
            payload,
            enrichment: Map::new(),
            meta: EventMeta {
                id: 0,
                stream: None,
                received_at: now,
            },
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.meta.stream = Some(stream.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn stream(&self) -> Option<&str> {
        self.meta.stream.as_deref()
    }

    /// Adds (or replaces) an enrichment field, returning the previous value.
    pub fn enrich(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.enrichment.insert(key.into(), value.into())
    }

    /// Looks up a value by a JSON Pointer over the event document.
    ///
    /// `/payload/..` and `/enrichment/..` address those maps explicitly, `/id`,
    /// `/stream` and `/timestamp` address the event attributes. Any other
    /// pointer is tried against the payload first and then the enrichment.
    pub fn lookup(&self, pointer: &str) -> Option<Cow<'_, Value>> {
        let (head, tail) = split_pointer(pointer)?;
        match &*head {
            "payload" => map_pointer(&self.payload, tail).map(Cow::Borrowed),
            "enrichment" => map_pointer(&self.enrichment, tail).map(Cow::Borrowed),
            "id" if tail.is_empty() => Some(Cow::Owned(Value::from(self.meta.id))),
            "stream" if tail.is_empty() => self
                .meta
                .stream
                .as_ref()
                .map(|s| Cow::Owned(Value::String(s.clone()))),
            "timestamp" if tail.is_empty() && !self.payload.contains_key("timestamp") => {
                Some(Cow::Owned(Value::String(self.timestamp.to_rfc3339())))
            }
            _ => map_pointer(&self.payload, pointer)
                .or_else(|| map_pointer(&self.enrichment, pointer))
                .map(Cow::Borrowed),
        }
    }
}

/// Resolves a JSON Pointer against a map. The empty pointer is rejected since
/// the map itself is not a `Value`.
pub fn map_pointer<'a>(map: &'a Map<String, Value>, pointer: &str) -> Option<&'a Value> {
    let (head, tail) = split_pointer(pointer)?;
    map.get(&*head)?.pointer(tail)
}

/// Removes the value addressed by a JSON Pointer from a map.
pub fn map_pointer_remove(map: &mut Map<String, Value>, pointer: &str) -> Option<Value> {
    let (head, tail) = split_pointer(pointer)?;
    if tail.is_empty() {
        return map.remove(&*head);
    }
    let (parent, last) = tail.rsplit_once('/')?;
    let last = unescape(last);
    match map.get_mut(&*head)?.pointer_mut(parent)? {
        Value::Object(inner) => inner.remove(&*last),
        _ => None,
    }
}

fn split_pointer(pointer: &str) -> Option<(Cow<'_, str>, &str)> {
    let rest = pointer.strip_prefix('/')?;
    let (head, tail) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    Some((unescape(head), tail))
}

fn unescape(token: &str) -> Cow<'_, str> {
    if token.contains('~') {
        Cow::Owned(token.replace("~1", "/").replace("~0", "~"))
    } else {
        Cow::Borrowed(token)
    }
}
