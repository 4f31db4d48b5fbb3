use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tlm_core::{Event, Plugin, PluginError, Value};

/// Adds a timestamp to the enrichment of every event.
///
/// An existing field is kept unless `overwrite` is set, so running the
/// plugin again over an already stamped event changes nothing.
#[derive(Deserialize, Debug)]
pub struct AddTimestamp {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_field")]
    field: String,
    #[serde(default)]
    format: TimestampFormat,
    #[serde(default)]
    source: TimeSource,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    EpochMillis,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    // processing time
    #[default]
    Now,
    // the event's own timestamp
    Event,
}

fn default_name() -> String {
    "add_timestamp".to_string()
}

fn default_field() -> String {
    "timestamp".to_string()
}

impl AddTimestamp {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            field: field.into(),
            format: TimestampFormat::default(),
            source: TimeSource::default(),
            overwrite: false,
        }
    }

    pub fn format(mut self, format: TimestampFormat) -> Self {
        self.format = format;
        self
    }

    pub fn source(mut self, source: TimeSource) -> Self {
        self.source = source;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl Plugin for AddTimestamp {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        if !self.overwrite && event.enrichment.contains_key(&self.field) {
            return Ok(Some(event));
        }
        let time = match self.source {
            TimeSource::Now => Utc::now(),
            TimeSource::Event => event.timestamp,
        };
        let value = match self.format {
            TimestampFormat::Rfc3339 => {
                Value::String(time.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            TimestampFormat::EpochMillis => Value::from(time.timestamp_millis()),
        };
        event.enrich(self.field.clone(), value);
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tlm_core::{codec::object, value};

    use super::*;

    fn event() -> Event {
        Event::new(object(value!({"v": 1})))
            .with_timestamp(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap())
    }

    #[test]
    fn stamps_event_time() {
        let plugin = AddTimestamp::new("ts").source(TimeSource::Event);
        let out = plugin.on_event(event()).unwrap().unwrap();
        assert_eq!(out.enrichment["ts"], value!("2023-11-14T22:13:20.123Z"));

        let millis = AddTimestamp::new("ts")
            .source(TimeSource::Event)
            .format(TimestampFormat::EpochMillis);
        let out = millis.on_event(event()).unwrap().unwrap();
        assert_eq!(out.enrichment["ts"], value!(1_700_000_000_123i64));
    }

    #[test]
    fn keeps_existing_field_unless_overwriting() {
        let mut e = event();
        e.enrich("ts", "earlier");

        let keep = AddTimestamp::new("ts");
        let out = keep.on_event(e.clone()).unwrap().unwrap();
        assert_eq!(out.enrichment["ts"], value!("earlier"));

        let replace = AddTimestamp::new("ts").overwrite(true);
        let out = replace.on_event(e).unwrap().unwrap();
        assert_ne!(out.enrichment["ts"], value!("earlier"));
    }

    #[test]
    fn processing_time_is_rerun_stable() {
        let plugin = AddTimestamp::new("timestamp");
        let once = plugin.on_event(event()).unwrap().unwrap();
        let twice = plugin.on_event(once.clone()).unwrap().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn deserialize_defaults() {
        let plugin: AddTimestamp =
            serde_json::from_value(value!({"format": "epoch_millis"})).unwrap();
        assert_eq!(plugin.name(), "add_timestamp");
        assert_eq!(plugin.field, "timestamp");
        assert_eq!(plugin.format, TimestampFormat::EpochMillis);
        assert_eq!(plugin.source, TimeSource::Now);
    }
}
