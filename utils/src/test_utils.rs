//! Utilities for testing

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use tlm_core::{
    codec::object, Event, ExportError, Exporter, Plugin, PluginError, Value,
};
use tokio::sync::Semaphore;

pub fn event(payload: Value) -> Event {
    Event::new(object(payload))
}

/// Records every exported event. Can be switched into a failing mode to
/// simulate an unavailable downstream.
#[derive(Clone)]
pub struct MemoryExporter {
    id: String,
    events: Arc<Mutex<Vec<Event>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryExporter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            events: Default::default(),
            failing: Default::default(),
            attempts: Default::default(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Exporter for MemoryExporter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ExportError::Unavailable(format!("{} is down", self.id)));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Holds every export until permits are handed out with [`GateExporter::open`].
#[derive(Clone)]
pub struct GateExporter {
    gate: Arc<Semaphore>,
    inner: MemoryExporter,
}

impl GateExporter {
    pub fn closed(id: impl Into<String>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            inner: MemoryExporter::new(id),
        }
    }

    pub fn open(&self, exports: usize) {
        self.gate.add_permits(exports);
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events()
    }
}

#[async_trait]
impl Exporter for GateExporter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| ExportError::Unavailable(e.to_string()))?
            .forget();
        self.inner.export(event).await
    }
}

/// Fails every event whose payload has `field` set to `true`.
pub struct FailingPlugin {
    pub field: String,
}

impl Plugin for FailingPlugin {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_event(&self, event: Event) -> Result<Option<Event>, PluginError> {
        match event.payload.get(&self.field) {
            Some(Value::Bool(true)) => Err(PluginError::failed(
                self.name(),
                format!("{} is set", self.field),
            )),
            _ => Ok(Some(event)),
        }
    }
}

/// Panics on every event whose payload has `field` set to `true`.
pub struct PanickingPlugin {
    pub field: String,
}

impl Plugin for PanickingPlugin {
    fn name(&self) -> &str {
        "panicking"
    }

    fn on_event(&self, event: Event) -> Result<Option<Event>, PluginError> {
        if let Some(Value::Bool(true)) = event.payload.get(&self.field) {
            panic!("{} is set", self.field);
        }
        Ok(Some(event))
    }
}
