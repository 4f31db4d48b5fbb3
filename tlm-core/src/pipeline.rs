//! Bounded queue and worker pool.
//!
//! Admitted events are sharded by stream onto per-worker FIFO channels, so
//! events of one stream are processed in admission order; events without a
//! stream are spread round-robin. The total number of queued events is
//! bounded by a semaphore: a permit is taken on admission and released when a
//! worker dequeues the event.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    breaker::CircuitBreaker,
    output::Output,
    plugin::{PluginError, PluginHost},
    schema::{Schema, SchemaError},
    stats::{Outcome, Stats, StatsSnapshot},
    Event,
};

#[derive(Deserialize, Debug, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    // stamp `processed_at` before the plugin chain
    #[serde(default = "default_enrich")]
    pub enrich: bool,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    #[serde(default)]
    pub schema: Schema,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            workers: default_workers(),
            enrich: default_enrich(),
            overflow: OverflowPolicy::default(),
            schema: Schema::default(),
        }
    }
}

pub fn default_capacity() -> usize {
    1024
}

pub fn default_workers() -> usize {
    4
}

fn default_enrich() -> bool {
    true
}

fn default_block_timeout_ms() -> u64 {
    100
}

/// What admission does when the queue is full.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Reject,
    Block {
        #[serde(default = "default_block_timeout_ms")]
        timeout_ms: u64,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Overloaded {
    #[error("queue is full ({capacity} events)")]
    QueueFull { capacity: usize },
    #[error("queue stayed full for {waited_ms}ms")]
    Timeout { waited_ms: u64 },
    #[error("downstream {exporter} is unavailable")]
    DownstreamUnavailable { exporter: String },
    #[error("pipeline is shutting down")]
    Closed,
}

struct Queued {
    event: Event,
    permit: OwnedSemaphorePermit,
}

enum Job {
    Process(Queued),
    Stop,
}

struct Shared {
    capacity: usize,
    overflow: OverflowPolicy,
    permits: Arc<Semaphore>,
    shards: Vec<flume::Sender<Job>>,
    closed: RwLock<bool>,
    next_id: AtomicU64,
    next_shard: AtomicUsize,
    stats: Arc<Stats>,
    breaker: Arc<CircuitBreaker>,
}

/// Cheap, cloneable admission side of a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    /// Admits an event into the queue and returns the id assigned to it.
    pub async fn enqueue(&self, event: Event) -> Result<u64, Overloaded> {
        let result = self.try_enqueue(event).await;
        match &result {
            Ok(_) => self.shared.stats.accepted(),
            Err(e) => {
                debug!("event rejected, {e}");
                self.shared.stats.rejected_overload();
            }
        }
        result
    }

    async fn try_enqueue(&self, mut event: Event) -> Result<u64, Overloaded> {
        let shared = &self.shared;
        if shared.breaker.is_rejecting() {
            return Err(Overloaded::DownstreamUnavailable {
                exporter: shared.breaker.name().to_string(),
            });
        }
        let permit = match shared.overflow {
            OverflowPolicy::Reject => {
                Arc::clone(&shared.permits)
                    .try_acquire_owned()
                    .map_err(|e| match e {
                        TryAcquireError::Closed => Overloaded::Closed,
                        TryAcquireError::NoPermits => Overloaded::QueueFull {
                            capacity: shared.capacity,
                        },
                    })?
            }
            OverflowPolicy::Block { timeout_ms } => {
                let wait = Duration::from_millis(timeout_ms);
                match timeout(wait, Arc::clone(&shared.permits).acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(Overloaded::Closed),
                    Err(_) => {
                        return Err(Overloaded::Timeout {
                            waited_ms: timeout_ms,
                        })
                    }
                }
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        event.meta.id = id;
        let shard = shared.shard_for(event.stream());
        shared.push(shard, Job::Process(Queued { event, permit }))?;
        Ok(id)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Events admitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.shared
            .capacity
            .saturating_sub(self.shared.permits.available_permits())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.queued() as u64)
    }

    /// False while the output's circuit is open and admission is refused.
    pub fn is_healthy(&self) -> bool {
        !self.shared.breaker.is_rejecting()
    }

    pub(crate) fn record_parse_rejection(&self) {
        self.shared.stats.rejected_parse();
    }
}

impl Shared {
    fn shard_for(&self, stream: Option<&str>) -> usize {
        let n = self.shards.len();
        match stream {
            Some(stream) => {
                let mut hasher = DefaultHasher::new();
                stream.hash(&mut hasher);
                (hasher.finish() % n as u64) as usize
            }
            None => self.next_shard.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    // the read lock makes admission and shutdown mutually exclusive, so no
    // event can land behind a worker's stop marker
    fn push(&self, shard: usize, job: Job) -> Result<(), Overloaded> {
        let closed = self.closed.read().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Err(Overloaded::Closed);
        }
        self.shards[shard].send(job).map_err(|_| Overloaded::Closed)
    }

    fn close(&self) {
        let mut closed = self.closed.write().unwrap_or_else(|e| e.into_inner());
        *closed = true;
        for tx in &self.shards {
            let _ = tx.send(Job::Stop);
        }
        drop(closed);
        self.permits.close();
    }
}

/// A running pipeline: queue, workers, output and optional dead-letter sink.
pub struct Pipeline {
    handle: PipelineHandle,
    workers: Vec<JoinHandle<()>>,
    output: Output,
    dead_letter: Option<Output>,
}

impl Pipeline {
    /// Spawns the workers on the current tokio runtime.
    pub fn start(
        config: PipelineConfig,
        host: PluginHost,
        output: Output,
        dead_letter: Option<Output>,
    ) -> Self {
        let capacity = config.capacity.max(1);
        let workers = config.workers.max(1);
        let stats = Arc::new(Stats::new());
        let dispatcher = Dispatcher::new(config.schema, config.enrich, host);

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            // capacity is enforced by the semaphore, not by the channel
            let (tx, rx) = flume::unbounded();
            shards.push(tx);
            let worker = Worker {
                index,
                rx,
                dispatcher: dispatcher.clone(),
                output: output.clone(),
                dead_letter: dead_letter.clone(),
                stats: Arc::clone(&stats),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        info!(
            "pipeline started with {workers} workers, capacity {capacity}, {} plugins, output {}",
            dispatcher.host.len(),
            output.id()
        );

        let shared = Shared {
            capacity,
            overflow: config.overflow,
            permits: Arc::new(Semaphore::new(capacity)),
            shards,
            closed: RwLock::new(false),
            next_id: AtomicU64::new(0),
            next_shard: AtomicUsize::new(0),
            stats,
            breaker: Arc::clone(output.breaker()),
        };
        Self {
            handle: PipelineHandle {
                shared: Arc::new(shared),
            },
            workers: handles,
            output,
            dead_letter,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    /// Stops admission, drains every admitted event and waits for the
    /// workers.
    pub async fn shutdown(self) -> StatsSnapshot {
        self.handle.shared.close();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("pipeline worker ended abnormally, {e}");
            }
        }
        if let Err(e) = self.output.flush().await {
            error!("failed to flush output {}, {e}", self.output.id());
        }
        if let Some(dead_letter) = &self.dead_letter {
            if let Err(e) = dead_letter.flush().await {
                error!("failed to flush dead letter {}, {e}", dead_letter.id());
            }
        }
        let stats = self.handle.stats();
        info!("pipeline stopped, {stats:?}");
        stats
    }
}

/// The per-event stages between the queue and the output: schema
/// validation, then lightweight enrichment and the plugin chain.
#[derive(Clone)]
pub struct Dispatcher {
    schema: Arc<Schema>,
    enrich: bool,
    host: PluginHost,
}

impl Dispatcher {
    pub fn new(schema: Schema, enrich: bool, host: PluginHost) -> Self {
        Self {
            schema: Arc::new(schema),
            enrich,
            host,
        }
    }

    pub fn validate(&self, event: &Event) -> Result<(), SchemaError> {
        self.schema.check(event)
    }

    /// Stamps `processed_at` when enrichment is on, then runs the plugin
    /// chain. `Ok(None)` means a plugin filtered the event out.
    pub fn dispatch(&self, mut event: Event) -> Result<Option<Event>, PluginError> {
        if self.enrich {
            event.enrich("processed_at", Utc::now().to_rfc3339());
        }
        self.host.run(event)
    }
}

struct Worker {
    index: usize,
    rx: flume::Receiver<Job>,
    dispatcher: Dispatcher,
    output: Output,
    dead_letter: Option<Output>,
    stats: Arc<Stats>,
}

impl Worker {
    async fn run(self) {
        while let Ok(job) = self.rx.recv_async().await {
            let Job::Process(Queued { event, permit }) = job else {
                break;
            };
            drop(permit);
            let outcome = self.process(event).await;
            self.stats.record(outcome);
        }
        debug!("pipeline worker {} stopped", self.index);
    }

    async fn process(&self, event: Event) -> Outcome {
        let id = event.id();

        // validate, keeping the event for the dead letter
        if let Err(e) = self.dispatcher.validate(&event) {
            warn!("event {id} is invalid, {e}");
            self.dead_letter(event, "validate", e.to_string()).await;
            return Outcome::Invalid;
        }

        // enrich and run the plugin chain
        let original = self.dead_letter.as_ref().map(|_| event.clone());
        let event = match self.dispatcher.dispatch(event) {
            Ok(Some(event)) => event,
            Ok(None) => return Outcome::Filtered,
            Err(e) => {
                if let Some(original) = original {
                    self.dead_letter(original, "plugin", e.to_string()).await;
                }
                return Outcome::PluginFailed;
            }
        };

        // emit
        match self.output.emit(&event).await {
            Ok(()) => {
                debug!("event {id} is emitted by worker {}", self.index);
                Outcome::Emitted
            }
            Err(e) => {
                warn!("event {id} could not be emitted, {e}");
                self.dead_letter(event, "emit", e.to_string()).await;
                Outcome::EmitFailed
            }
        }
    }

    async fn dead_letter(&self, mut event: Event, stage: &str, reason: String) {
        let Some(dead_letter) = &self.dead_letter else {
            return;
        };
        event.enrich("error", json!({ "stage": stage, "reason": reason }));
        match dead_letter.emit(&event).await {
            Ok(()) => self.stats.dead_lettered(),
            Err(e) => error!("event {} is lost, dead letter failed, {e}", event.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        breaker::BreakerConfig,
        output::{BackoffPolicy, Exporter, OutputConfig},
        plugin::{Plugin, PluginError, PluginRegistry},
        schema::FieldKind,
        test_utils::{event, Down, Gate, Memory},
    };

    struct RejectBad;

    impl Plugin for RejectBad {
        fn name(&self) -> &str {
            "reject-bad"
        }

        fn on_event(&self, event: Event) -> Result<Option<Event>, PluginError> {
            match event.payload.get("bad") {
                Some(Value::Bool(true)) => panic!("cannot handle bad events"),
                Some(Value::String(_)) => Err(PluginError::failed(self.name(), "bad string")),
                _ => Ok(Some(event)),
            }
        }
    }

    fn output(exporter: impl Exporter) -> Output {
        Output::new(
            exporter,
            OutputConfig {
                retry: BackoffPolicy {
                    max_retries: 0,
                    timeout_ms: 0,
                    base_delay_ms: 1,
                    max_delay_ms: 1,
                },
                circuit_breaker: BreakerConfig {
                    failure_threshold: 1,
                    success_threshold: 1,
                    open_timeout_ms: 60_000,
                },
            },
        )
    }

    fn config(capacity: usize, workers: usize) -> PipelineConfig {
        PipelineConfig {
            capacity,
            workers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn every_admitted_event_reaches_the_output() {
        let _ = tracing_subscriber::fmt::try_init();

        let memory = Memory::default();
        let pipeline = Pipeline::start(config(64, 4), PluginHost::empty(), output(memory.clone()), None);
        let handle = pipeline.handle();

        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(handle.enqueue(event(json!({ "seq": i }))).await.unwrap());
        }
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.accepted, 50);
        assert_eq!(stats.emitted, 50);
        assert_eq!(stats.settled(), stats.accepted);
        assert_eq!(stats.queued, 0);

        let mut emitted: Vec<u64> = memory.events().iter().map(Event::id).collect();
        emitted.sort_unstable();
        ids.sort_unstable();
        assert_eq!(emitted, ids);
        assert!(memory.events()[0].enrichment.contains_key("processed_at"));
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_overwriting() {
        let gate = Gate::closed();
        let pipeline = Pipeline::start(config(2, 1), PluginHost::empty(), output(gate.clone()), None);
        let handle = pipeline.handle();

        let mut accepted = 0;
        let mut rejected = Vec::new();
        // one event may be held by the worker, two fit in the queue
        for i in 0..4 {
            match handle.enqueue(event(json!({ "seq": i }))).await {
                Ok(_) => accepted += 1,
                Err(e) => rejected.push(e),
            }
            assert!(handle.queued() <= handle.capacity());
        }
        assert!(accepted <= 3);
        assert!(!rejected.is_empty());
        assert!(rejected
            .iter()
            .all(|e| *e == Overloaded::QueueFull { capacity: 2 }));

        gate.open(16);
        let stats = pipeline.shutdown().await;
        assert_eq!(stats.emitted, accepted);
        assert_eq!(stats.rejected_overload, rejected.len() as u64);
        let seqs: Vec<Value> = gate
            .events()
            .iter()
            .map(|e| e.payload["seq"].clone())
            .collect();
        let expected: Vec<Value> = (0..accepted).map(|i| json!(i)).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn block_policy_waits_then_times_out() {
        let gate = Gate::closed();
        let mut config = config(1, 1);
        config.overflow = OverflowPolicy::Block { timeout_ms: 20 };
        let pipeline = Pipeline::start(config, PluginHost::empty(), output(gate.clone()), None);
        let handle = pipeline.handle();

        let mut errors = Vec::new();
        for i in 0..4 {
            if let Err(e) = handle.enqueue(event(json!({ "seq": i }))).await {
                errors.push(e);
            }
        }
        assert!(errors.contains(&Overloaded::Timeout { waited_ms: 20 }));

        gate.open(16);
        let stats = pipeline.shutdown().await;
        assert_eq!(stats.settled(), stats.accepted);
    }

    #[tokio::test]
    async fn plugin_failures_are_contained_per_event() {
        let _ = tracing_subscriber::fmt::try_init();

        let memory = Memory::default();
        let dead = Memory::default();
        let mut registry = PluginRegistry::new();
        registry.register("reject-bad", RejectBad).unwrap();
        let pipeline = Pipeline::start(
            config(64, 2),
            registry.into_host(),
            output(memory.clone()),
            Some(output(dead.clone())),
        );
        let handle = pipeline.handle();

        for i in 0..10 {
            handle.enqueue(event(json!({ "seq": i }))).await.unwrap();
        }
        handle.enqueue(event(json!({ "bad": true }))).await.unwrap();
        handle.enqueue(event(json!({ "bad": "yes" }))).await.unwrap();
        for i in 10..20 {
            handle.enqueue(event(json!({ "seq": i }))).await.unwrap();
        }
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.emitted, 20);
        assert_eq!(stats.plugin_failed, 2);
        assert_eq!(stats.dead_lettered, 2);
        assert_eq!(memory.events().len(), 20);
        for e in dead.events() {
            assert_eq!(e.enrichment["error"]["stage"], json!("plugin"));
        }
    }

    #[tokio::test]
    async fn invalid_events_are_dead_lettered() {
        let memory = Memory::default();
        let dead = Memory::default();
        let mut config = config(16, 1);
        config.schema = Schema::new().require("/name", FieldKind::String);
        let pipeline = Pipeline::start(
            config,
            PluginHost::empty(),
            output(memory.clone()),
            Some(output(dead.clone())),
        );
        let handle = pipeline.handle();
        handle.enqueue(event(json!({ "name": "ok" }))).await.unwrap();
        handle.enqueue(event(json!({ "name": 1 }))).await.unwrap();
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.invalid, 1);
        let dead = dead.events();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].enrichment["error"]["stage"], json!("validate"));
        assert_eq!(dead[0].payload["name"], json!(1));
    }

    #[tokio::test]
    async fn stream_order_is_preserved_across_workers() {
        let memory = Memory::default();
        let pipeline = Pipeline::start(config(512, 4), PluginHost::empty(), output(memory.clone()), None);
        let handle = pipeline.handle();
        for i in 0..200 {
            let stream = ["a", "b", "c"][i % 3];
            handle
                .enqueue(event(json!({ "seq": i })).with_stream(stream))
                .await
                .unwrap();
        }
        pipeline.shutdown().await;

        for stream in ["a", "b", "c"] {
            let seqs: Vec<u64> = memory
                .events()
                .iter()
                .filter(|e| e.stream() == Some(stream))
                .map(|e| e.payload["seq"].as_u64().unwrap())
                .collect();
            let mut sorted = seqs.clone();
            sorted.sort_unstable();
            assert_eq!(seqs, sorted, "stream {stream} was reordered");
        }
    }

    #[tokio::test]
    async fn open_circuit_throttles_admission() {
        let pipeline = Pipeline::start(config(16, 1), PluginHost::empty(), output(Down), None);
        let handle = pipeline.handle();
        handle.enqueue(event(json!({ "v": 1 }))).await.unwrap();

        let mut waited = 0;
        while handle.is_healthy() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert!(!handle.is_healthy());
        assert_eq!(
            handle.enqueue(event(json!({ "v": 2 }))).await,
            Err(Overloaded::DownstreamUnavailable {
                exporter: "down".to_string()
            })
        );
        let stats = pipeline.shutdown().await;
        assert_eq!(stats.emit_failed, 1);
        assert_eq!(stats.rejected_overload, 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_events() {
        let pipeline = Pipeline::start(config(4, 1), PluginHost::empty(), output(Memory::default()), None);
        let handle = pipeline.handle();
        pipeline.shutdown().await;
        assert_eq!(
            handle.enqueue(event(json!({ "v": 1 }))).await,
            Err(Overloaded::Closed)
        );
    }

    #[test]
    fn dispatcher_validates_then_runs_the_chain() {
        let schema = Schema::new().require("/name", FieldKind::String);
        let mut registry = PluginRegistry::new();
        registry.register("reject-bad", RejectBad).unwrap();
        let dispatcher = Dispatcher::new(schema, true, registry.into_host());

        assert_eq!(
            dispatcher.validate(&event(json!({ "v": 1 }))).unwrap_err(),
            SchemaError::MissingField("/name".to_string())
        );

        let valid = event(json!({ "name": "cpu" }));
        dispatcher.validate(&valid).unwrap();
        let out = dispatcher.dispatch(valid).unwrap().unwrap();
        assert!(out.enrichment["processed_at"].is_string());

        let err = dispatcher
            .dispatch(event(json!({ "name": "cpu", "bad": "yes" })))
            .unwrap_err();
        assert_eq!(err.plugin(), "reject-bad");

        let plain = Dispatcher::new(Schema::default(), false, PluginHost::empty());
        let out = plain.dispatch(event(json!({ "a": 1 }))).unwrap().unwrap();
        assert!(out.enrichment.is_empty());
    }
}
