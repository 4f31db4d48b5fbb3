pub mod breaker;
pub mod codec;
mod event;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod plugin;
pub mod schema;
pub mod stats;
#[cfg(test)]
mod test_utils;

pub use event::{map_pointer, map_pointer_remove, Event, EventMeta};
pub use ingest::{IngestError, Ingestor, Receipt};
pub use output::{Exporter, ExportError, Output};
pub use pipeline::{Dispatcher, Overloaded, Pipeline, PipelineConfig, PipelineHandle};
pub use plugin::{Plugin, PluginError, PluginHost, PluginRegistry};
pub use serde_json::json as value;
pub use serde_json::{Map, Value};
