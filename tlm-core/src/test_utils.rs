use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::{
    codec::object,
    output::{ExportError, Exporter},
    Event,
};

pub(crate) fn event(payload: Value) -> Event {
    Event::new(object(payload))
}

#[derive(Clone, Default)]
pub(crate) struct Memory {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Memory {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exporter for Memory {
    fn id(&self) -> &str {
        "memory"
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// blocks every export until the test hands out permits
#[derive(Clone)]
pub(crate) struct Gate {
    open: Arc<Semaphore>,
    inner: Memory,
}

impl Gate {
    pub(crate) fn closed() -> Self {
        Self {
            open: Arc::new(Semaphore::new(0)),
            inner: Memory::default(),
        }
    }

    pub(crate) fn open(&self, exports: usize) {
        self.open.add_permits(exports);
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.inner.events()
    }
}

#[async_trait]
impl Exporter for Gate {
    fn id(&self) -> &str {
        "gate"
    }

    async fn export(&self, event: &Event) -> Result<(), ExportError> {
        self.open
            .acquire()
            .await
            .map_err(|e| ExportError::Unavailable(e.to_string()))?
            .forget();
        self.inner.export(event).await
    }
}

pub(crate) struct Down;

#[async_trait]
impl Exporter for Down {
    fn id(&self) -> &str {
        "down"
    }

    async fn export(&self, _event: &Event) -> Result<(), ExportError> {
        Err(ExportError::Unavailable("connection refused".to_string()))
    }
}
