use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use quarry_wire::{ArtifactChunk, EventEnvelope};

/// How a sink rejected an ingest call.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The payload was dropped but the run may continue.
    #[error("sink dropped payload: {0}")]
    Droppable(String),
    /// The sink cannot make progress; the run fails as a policy failure.
    #[error("sink failure: {0}")]
    Fatal(String),
}

impl SinkError {
    /// Whether the run may continue past this error.
    pub fn is_droppable(&self) -> bool {
        matches!(self, SinkError::Droppable(_))
    }
}

/// Counters a sink exposes for run reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkStats {
    /// Events offered to the sink.
    pub total_events: u64,
    /// Events durably accepted.
    pub events_persisted: u64,
    /// Events dropped (at-least-once sinks may still have persisted them).
    pub events_dropped: u64,
    /// Flush invocations keyed by trigger label.
    pub flush_triggers: BTreeMap<String, u64>,
}

/// The event-consuming interface implemented by persistence backends.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Ingest one event envelope.
    async fn ingest_event(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;

    /// Ingest one artifact chunk.
    async fn ingest_chunk(&self, chunk: &ArtifactChunk) -> Result<(), SinkError>;

    /// Persist buffered data. `trigger` labels the flush in [`SinkStats`].
    async fn flush(&self, trigger: &str) -> Result<(), SinkError>;

    /// Snapshot the sink's counters.
    fn stats(&self) -> SinkStats;
}

/// Partition-addressed writer for sidecar files.
///
/// The ingestion engine sanitizes filenames before they reach `put`.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Persist one file under the writer's partition.
    async fn put(&self, filename: &str, content_type: &str, data: &[u8]) -> anyhow::Result<()>;
}
