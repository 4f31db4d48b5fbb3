use std::{fs::File, future::Future, io::BufReader, path::Path};

use serde::Deserialize;
use thiserror::Error;
use tlm_core::{
    codec::ParseLimits,
    output::OutputConfig,
    pipeline::PipelineConfig,
    plugin::RegistryError,
    Exporter, Ingestor, Output, Plugin, PluginHost, PluginRegistry,
};
use tlm_enrich_plugins::{AddFields, AddTimestamp, Lookup, RemoveFields, RenameFields};
use tlm_event_filter::EventFilter;
use tlm_file_dispatcher::FileDispatcher;
use tlm_http_collector::HttpCollector;
use tlm_redis_dispatcher::RedisDispatcher;
use tlm_tcp_collector::TcpCollector;
use tokio::net::TcpListener;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("can't read config file, {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config, {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("can't recognize config file format {0:?}, expected .yaml or .yml")]
    Format(String),
    #[error("invalid plugin chain, {0}")]
    Plugin(#[from] RegistryError),
    #[error("no collector is configured")]
    NoCollector,
}

#[derive(Deserialize, Debug)]
pub(crate) struct Config {
    #[serde(default)]
    pub(crate) ingest: ParseLimits,
    #[serde(default)]
    pub(crate) pipeline: PipelineConfig,
    #[serde(default)]
    pub(crate) collectors: Vec<Collector>,
    #[serde(default)]
    pub(crate) plugins: Vec<PluginConfig>,
    pub(crate) output: OutputSection,
    pub(crate) dead_letter: Option<OutputSection>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct OutputSection {
    pub(crate) dispatcher: Dispatcher,
    #[serde(flatten)]
    pub(crate) config: OutputConfig,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub(crate) enum Collector {
    Tcp(TcpCollector),
    Http(HttpCollector),
}

impl Collector {
    pub(crate) fn id(&self) -> &str {
        match self {
            Collector::Tcp(c) => c.id(),
            Collector::Http(c) => c.id(),
        }
    }

    pub(crate) async fn bind(&self) -> std::io::Result<TcpListener> {
        let address = match self {
            Collector::Tcp(c) => &c.address,
            Collector::Http(c) => &c.address,
        };
        TcpListener::bind(address).await
    }

    pub(crate) async fn serve(
        &self,
        listener: TcpListener,
        ingestor: Ingestor,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        match self {
            Collector::Tcp(c) => c.serve(listener, ingestor, shutdown).await?,
            Collector::Http(c) => c.serve(listener, ingestor, shutdown).await?,
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub(crate) enum PluginConfig {
    AddTimestamp(AddTimestamp),
    AddFields(AddFields),
    RenameFields(RenameFields),
    RemoveFields(RemoveFields),
    Lookup(Lookup),
    Filter(EventFilter),
}

impl PluginConfig {
    pub(crate) fn into_plugin(self) -> Box<dyn Plugin> {
        match self {
            PluginConfig::AddTimestamp(p) => Box::new(p),
            PluginConfig::AddFields(p) => Box::new(p),
            PluginConfig::RenameFields(p) => Box::new(p),
            PluginConfig::RemoveFields(p) => Box::new(p),
            PluginConfig::Lookup(p) => Box::new(p),
            PluginConfig::Filter(p) => Box::new(p),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub(crate) enum Dispatcher {
    File(FileDispatcher),
    Redis(RedisDispatcher),
}

impl Dispatcher {
    pub(crate) fn into_exporter(self) -> Box<dyn Exporter> {
        match self {
            Dispatcher::File(d) => Box::new(d),
            Dispatcher::Redis(d) => Box::new(d),
        }
    }
}

impl OutputSection {
    fn into_output(self) -> Output {
        Output::new(self.dispatcher.into_exporter(), self.config)
    }
}

/// Everything needed to start the collector, checked and ready to run.
pub(crate) struct Assembly {
    pub(crate) limits: ParseLimits,
    pub(crate) pipeline: PipelineConfig,
    pub(crate) collectors: Vec<Collector>,
    pub(crate) host: PluginHost,
    pub(crate) output: Output,
    pub(crate) dead_letter: Option<Output>,
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self, Error> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        match extension {
            "yaml" | "yml" => Ok(serde_yaml::from_reader(BufReader::new(File::open(path)?))?),
            other => Err(Error::Format(other.to_string())),
        }
    }

    pub(crate) fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Registers the plugin chain in order and builds the outputs.
    pub(crate) fn assemble(self) -> Result<Assembly, Error> {
        if self.collectors.is_empty() {
            return Err(Error::NoCollector);
        }
        let mut registry = PluginRegistry::new();
        for plugin in self.plugins {
            let plugin = plugin.into_plugin();
            let name = plugin.name().to_string();
            registry.register(name, plugin)?;
        }
        Ok(Assembly {
            limits: self.ingest,
            pipeline: self.pipeline,
            collectors: self.collectors,
            host: registry.into_host(),
            output: self.output.into_output(),
            dead_letter: self.dead_letter.map(OutputSection::into_output),
        })
    }
}
