use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Event counters shared by the ingestors, the workers and the output.
///
/// Once the pipeline is drained, `accepted` equals the sum of the five
/// terminal outcomes.
#[derive(Debug, Default)]
pub struct Stats {
    accepted: AtomicU64,
    rejected_parse: AtomicU64,
    rejected_overload: AtomicU64,
    emitted: AtomicU64,
    filtered: AtomicU64,
    invalid: AtomicU64,
    plugin_failed: AtomicU64,
    emit_failed: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected_parse: u64,
    pub rejected_overload: u64,
    pub emitted: u64,
    pub filtered: u64,
    pub invalid: u64,
    pub plugin_failed: u64,
    pub emit_failed: u64,
    pub dead_lettered: u64,
    pub queued: u64,
}

/// Terminal outcome of an admitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Emitted,
    Filtered,
    Invalid,
    PluginFailed,
    EmitFailed,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected_parse(&self) {
        self.rejected_parse.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected_overload(&self) {
        self.rejected_overload.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Emitted => &self.emitted,
            Outcome::Filtered => &self.filtered,
            Outcome::Invalid => &self.invalid,
            Outcome::PluginFailed => &self.plugin_failed,
            Outcome::EmitFailed => &self.emit_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queued: u64) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_parse: self.rejected_parse.load(Ordering::Relaxed),
            rejected_overload: self.rejected_overload.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            plugin_failed: self.plugin_failed.load(Ordering::Relaxed),
            emit_failed: self.emit_failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            queued,
        }
    }
}

impl StatsSnapshot {
    /// Events that reached a terminal outcome.
    pub fn settled(&self) -> u64 {
        self.emitted + self.filtered + self.invalid + self.plugin_failed + self.emit_failed
    }
}
