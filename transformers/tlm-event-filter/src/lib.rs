use serde::Deserialize;
use tlm_core::{Event, Plugin, PluginError, Value};
use tracing::debug;

/// Keeps or drops events by include/exclude rules. Rules are evaluated in
/// order and the last matching one decides; an event no rule matches is
/// kept.
#[derive(Deserialize, Debug)]
pub struct EventFilter {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default)]
    rules: EventFilterRules,
}

fn default_name() -> String {
    "filter".to_string()
}

#[derive(Deserialize, Debug)]
#[serde(transparent)]
pub struct EventFilterRules {
    rules: Vec<EventFilterRule>,
}

impl Default for EventFilterRules {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
enum EventFilterRule {
    Include { field: String, equals: Option<Value> },
    Exclude { field: String, equals: Option<Value> },
}

impl EventFilter {
    pub fn new(name: impl Into<String>, rules: EventFilterRules) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

impl Plugin for EventFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: Event) -> Result<Option<Event>, PluginError> {
        if self.rules.eval(&event) {
            Ok(Some(event))
        } else {
            debug!("{} drops event {}", self.name, event.id());
            Ok(None)
        }
    }
}

impl EventFilterRules {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Keep events whose `field` equals `equals`, or merely exists when
    /// `equals` is `None`.
    pub fn include(mut self, field: impl Into<String>, equals: Option<Value>) -> Self {
        self.rules.push(EventFilterRule::Include {
            field: field.into(),
            equals,
        });
        self
    }

    /// Drop events whose `field` equals `equals`, or merely exists when
    /// `equals` is `None`.
    pub fn exclude(mut self, field: impl Into<String>, equals: Option<Value>) -> Self {
        self.rules.push(EventFilterRule::Exclude {
            field: field.into(),
            equals,
        });
        self
    }

    fn eval(&self, event: &Event) -> bool {
        self.rules.iter().fold(true, |st, rule| match rule {
            EventFilterRule::Include { field, equals } => {
                if matches(event, field, equals.as_ref()) {
                    true
                } else {
                    st
                }
            }
            EventFilterRule::Exclude { field, equals } => {
                if matches(event, field, equals.as_ref()) {
                    false
                } else {
                    st
                }
            }
        })
    }
}

fn matches(event: &Event, field: &str, equals: Option<&Value>) -> bool {
    let Some(value) = event.lookup(field) else {
        return false;
    };
    match equals {
        Some(expected) => value.as_ref() == expected,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use tlm_core::{codec::object, value};

    use super::*;

    fn event(payload: Value) -> Event {
        Event::new(object(payload))
    }

    #[test]
    fn no_rules_keeps_everything() {
        let filter = EventFilter::new("f", EventFilterRules::new());
        assert!(filter.on_event(event(value!({"a": 1}))).unwrap().is_some());
    }

    #[test]
    fn exclude_then_include_last_match_wins() {
        let rules = EventFilterRules::new()
            .exclude("/level", Some(value!("debug")))
            .include("/service", Some(value!("billing")));
        let filter = EventFilter::new("f", rules);

        let dropped = event(value!({"level": "debug", "service": "web"}));
        assert!(filter.on_event(dropped).unwrap().is_none());

        let rescued = event(value!({"level": "debug", "service": "billing"}));
        assert!(filter.on_event(rescued).unwrap().is_some());

        let untouched = event(value!({"level": "info"}));
        assert!(filter.on_event(untouched).unwrap().is_some());
    }

    #[test]
    fn existence_rules_and_stream() {
        let rules = EventFilterRules::new()
            .exclude("/stream", None)
            .include("/stream", Some(value!("audit")));
        let filter = EventFilter::new("f", rules);
        assert!(filter
            .on_event(event(value!({"a": 1})).with_stream("noise"))
            .unwrap()
            .is_none());
        assert!(filter
            .on_event(event(value!({"a": 1})).with_stream("audit"))
            .unwrap()
            .is_some());
        assert!(filter.on_event(event(value!({"a": 1}))).unwrap().is_some());
    }

    #[test]
    fn deserialize_rules() {
        let filter: EventFilter = serde_json::from_value(value!({
            "name": "drop-health",
            "rules": [
                {"action": "exclude", "field": "/path", "equals": "/health"},
                {"action": "include", "field": "/force"}
            ]
        }))
        .unwrap();
        assert_eq!(filter.name(), "drop-health");
        assert!(filter
            .on_event(event(value!({"path": "/health"})))
            .unwrap()
            .is_none());
        assert!(filter
            .on_event(event(value!({"path": "/health", "force": 1})))
            .unwrap()
            .is_some());
    }
}
