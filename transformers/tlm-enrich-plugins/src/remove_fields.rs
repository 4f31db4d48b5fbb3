use serde::Deserialize;
use tlm_core::{map_pointer_remove, Event, Plugin, PluginError};

/// Removes payload fields, given as JSON Pointers or plain top-level keys.
#[derive(Deserialize, Debug)]
pub struct RemoveFields {
    #[serde(default = "default_name")]
    name: String,
    fields: Vec<String>,
}

fn default_name() -> String {
    "remove_fields".to_string()
}

impl RemoveFields {
    pub fn new(fields: Vec<String>) -> Self {
        Self {
            name: default_name(),
            fields,
        }
    }
}

impl Plugin for RemoveFields {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        for field in &self.fields {
            if field.starts_with('/') {
                map_pointer_remove(&mut event.payload, field);
            } else {
                event.payload.remove(field);
            }
        }
        Ok(Some(event))
    }
}
