//! Plugin contract, registry and the host running the plugin chain.
//!
//! Plugins are registered into a [`PluginRegistry`] at startup. The registry
//! is then frozen into a [`PluginHost`], which is immutable and cheap to clone
//! into every pipeline worker.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::Event;

/// A named transform over an [`Event`].
///
/// `on_event` returns `Ok(Some(event))` to hand the (possibly modified) event
/// to the next stage, `Ok(None)` to filter it out and `Err` when the event
/// can't be processed. A plugin panicking is contained by the host and
/// reported as [`PluginError::Panicked`] for that event only.
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn on_event(&self, event: Event) -> Result<Option<Event>, PluginError>;
}

impl Plugin for Box<dyn Plugin> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_event(&self, event: Event) -> Result<Option<Event>, PluginError> {
        (**self).on_event(event)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin {plugin} failed, {reason}")]
    Failed { plugin: String, reason: String },
    #[error("plugin {plugin} panicked, {message}")]
    Panicked { plugin: String, message: String },
}

impl PluginError {
    pub fn failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn plugin(&self) -> &str {
        match self {
            PluginError::Failed { plugin, .. } | PluginError::Panicked { plugin, .. } => plugin,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin {0} has already been registered")]
    Duplicate(String),
}

struct Stage {
    name: String,
    plugin: Box<dyn Plugin>,
}

#[derive(Default)]
pub struct PluginRegistry {
    stages: Vec<Stage>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin to the chain. Names are unique within a registry.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        plugin: impl Plugin,
    ) -> Result<&mut Self, RegistryError> {
        let name = name.into();
        if self.stages.iter().any(|s| s.name == name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!("registered plugin {name}");
        self.stages.push(Stage {
            name,
            plugin: Box::new(plugin),
        });
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn into_host(self) -> PluginHost {
        PluginHost {
            chain: self.stages.into(),
        }
    }
}

/// Runs the frozen plugin chain.
#[derive(Clone)]
pub struct PluginHost {
    chain: Arc<[Stage]>,
}

impl PluginHost {
    /// A host without plugins, passing every event through unchanged.
    pub fn empty() -> Self {
        PluginRegistry::new().into_host()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Applies every plugin in registration order, each receiving the
    /// previous one's output. Stops at the first plugin filtering the event
    /// out or failing.
    pub fn run(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        for stage in self.chain.iter() {
            let id = event.id();
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.plugin.on_event(event)))
                .map_err(|panic| PluginError::Panicked {
                    plugin: stage.name.clone(),
                    message: panic_message(panic.as_ref()),
                })
                .and_then(|r| r.map_err(|e| rename(e, &stage.name)));
            match outcome {
                Ok(Some(next)) => event = next,
                Ok(None) => {
                    debug!("event {id} is filtered out by plugin {}", stage.name);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("event {id}: {e}");
                    return Err(e);
                }
            }
        }
        Ok(Some(event))
    }
}

// errors are reported under the registered name
fn rename(error: PluginError, name: &str) -> PluginError {
    match error {
        PluginError::Failed { reason, .. } => PluginError::failed(name, reason),
        PluginError::Panicked { message, .. } => PluginError::Panicked {
            plugin: name.to_string(),
            message,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::object;

    struct Tag(&'static str);

    impl Plugin for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn on_event(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
            let trail = match event.enrichment.remove("trail") {
                Some(serde_json::Value::String(s)) => format!("{s},{}", self.0),
                _ => self.0.to_string(),
            };
            event.enrich("trail", trail);
            Ok(Some(event))
        }
    }

    struct Reject;

    impl Plugin for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        fn on_event(&self, _event: Event) -> Result<Option<Event>, PluginError> {
            Err(PluginError::failed(self.name(), "bad event"))
        }
    }

    struct Explode;

    impl Plugin for Explode {
        fn name(&self) -> &str {
            "explode"
        }

        fn on_event(&self, _event: Event) -> Result<Option<Event>, PluginError> {
            panic!("boom")
        }
    }

    struct DropAll;

    impl Plugin for DropAll {
        fn name(&self) -> &str {
            "drop"
        }

        fn on_event(&self, _event: Event) -> Result<Option<Event>, PluginError> {
            Ok(None)
        }
    }

    fn event() -> Event {
        Event::new(object(json!({"v": 1})))
    }

    #[test]
    fn runs_in_registration_order() {
        let mut registry = PluginRegistry::new();
        registry
            .register("a", Tag("a"))
            .unwrap()
            .register("b", Tag("b"))
            .unwrap()
            .register("c", Tag("c"))
            .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["a", "b", "c"]);

        let host = registry.into_host();
        let out = host.run(event()).unwrap().unwrap();
        assert_eq!(out.enrichment["trail"], json!("a,b,c"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut registry = PluginRegistry::new();
        registry.register("a", Tag("a")).unwrap();
        let err = registry.register("a", Tag("other")).err().unwrap();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failure_stops_chain_and_is_reported() {
        let mut registry = PluginRegistry::new();
        registry.register("first", Tag("first")).unwrap();
        registry.register("strict", Reject).unwrap();
        registry.register("never", Tag("never")).unwrap();
        let host = registry.into_host();

        let err = host.run(event()).unwrap_err();
        assert_eq!(err, PluginError::failed("strict", "bad event"));
        assert_eq!(err.plugin(), "strict");
    }

    #[test]
    fn panic_is_contained() {
        let mut registry = PluginRegistry::new();
        registry.register("explode", Explode).unwrap();
        let host = registry.into_host();

        let err = host.run(event()).unwrap_err();
        assert_eq!(
            err,
            PluginError::Panicked {
                plugin: "explode".to_string(),
                message: "boom".to_string()
            }
        );
        // the host keeps working for the next event
        assert!(host.run(event()).is_err());
    }

    #[test]
    fn filter_short_circuits() {
        let mut registry = PluginRegistry::new();
        registry.register("drop", DropAll).unwrap();
        registry.register("explode", Explode).unwrap();
        assert_eq!(registry.into_host().run(event()), Ok(None));
    }

    #[test]
    fn empty_host_passes_through() {
        let e = event();
        assert_eq!(PluginHost::empty().run(e.clone()), Ok(Some(e)));
    }
}
