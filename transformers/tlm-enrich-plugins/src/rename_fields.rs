use std::collections::BTreeMap;

use serde::Deserialize;
use tlm_core::{Event, Plugin, PluginError};

/// Renames top-level payload fields. Missing fields are left alone, an
/// existing target is replaced. All renames see the payload as it was before
/// the plugin ran, so `a -> b` together with `b -> c` moves both values.
#[derive(Deserialize, Debug)]
pub struct RenameFields {
    #[serde(default = "default_name")]
    name: String,
    fields: BTreeMap<String, String>,
}

fn default_name() -> String {
    "rename_fields".to_string()
}

impl RenameFields {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self {
            name: default_name(),
            fields,
        }
    }
}

impl Plugin for RenameFields {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        let moved: Vec<_> = self
            .fields
            .iter()
            .filter_map(|(from, to)| event.payload.remove(from).map(|value| (to, value)))
            .collect();
        for (to, value) in moved {
            event.payload.insert(to.clone(), value);
        }
        Ok(Some(event))
    }
}
