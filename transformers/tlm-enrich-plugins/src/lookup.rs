use std::collections::BTreeMap;

use serde::Deserialize;
use tlm_core::{Event, Plugin, PluginError, Value};

/// Static table enrichment: the value at `source` selects an entry of
/// `table` which is stored under `target` in the enrichment. A miss stores
/// `default` when one is configured and leaves the event alone otherwise.
#[derive(Deserialize, Debug)]
pub struct Lookup {
    #[serde(default = "default_name")]
    name: String,
    source: String,
    target: String,
    table: BTreeMap<String, Value>,
    #[serde(default)]
    default: Option<Value>,
}

fn default_name() -> String {
    "lookup".to_string()
}

impl Lookup {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        table: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            name: default_name(),
            source: source.into(),
            target: target.into(),
            table,
            default: None,
        }
    }

    pub fn default_value(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

impl Plugin for Lookup {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        let key = match event.lookup(&self.source).as_deref() {
            Some(Value::String(s)) => Some(s.clone()),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => Some(v.to_string()),
            _ => None,
        };
        let found = key
            .and_then(|k| self.table.get(&k))
            .or(self.default.as_ref())
            .cloned();
        if let Some(value) = found {
            event.enrich(self.target.clone(), value);
        }
        Ok(Some(event))
    }
}
