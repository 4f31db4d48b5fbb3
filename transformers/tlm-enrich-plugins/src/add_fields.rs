use std::collections::BTreeMap;

use serde::Deserialize;
use tlm_core::{Event, Plugin, PluginError, Value};
use tracing::debug;
use utils::substitute_with_event;

/// Adds static fields to the enrichment. String values may reference the
/// event through `%{/pointer}` placeholders.
#[derive(Deserialize, Debug)]
pub struct AddFields {
    #[serde(default = "default_name")]
    name: String,
    fields: BTreeMap<String, Value>,
    // fail the event instead of skipping a field whose template can't render
    #[serde(default)]
    strict: bool,
}

fn default_name() -> String {
    "add_fields".to_string()
}

impl AddFields {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            name: default_name(),
            fields,
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Plugin for AddFields {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        for (key, value) in &self.fields {
            let value = match value {
                Value::String(template) => match substitute_with_event(template, &event) {
                    Ok(rendered) => Value::String(rendered),
                    Err(reason) if self.strict => {
                        return Err(PluginError::failed(&self.name, reason))
                    }
                    Err(reason) => {
                        debug!("skip field {key}, {reason}");
                        continue;
                    }
                },
                other => other.clone(),
            };
            event.enrich(key.clone(), value);
        }
        Ok(Some(event))
    }
}
