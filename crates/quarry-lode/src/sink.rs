use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use quarry_core::{EventSink, SinkError, SinkStats};
use quarry_wire::{ArtifactChunk, EventEnvelope};

struct BufferedLine {
    file_key: String,
    line: String,
    is_event: bool,
}

struct SinkInner {
    buffered: Vec<BufferedLine>,
    stats: SinkStats,
}

/// Buffers event records in memory and appends them as JSONL per run on
/// flush. At-least-once: a failed flush keeps the buffer, so a retried
/// flush may duplicate lines that already reached disk.
pub struct JsonlSink {
    root: PathBuf,
    inner: Mutex<SinkInner>,
}

impl JsonlSink {
    /// Create a sink writing under `root/events/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonlSink {
            root: root.into(),
            inner: Mutex::new(SinkInner {
                buffered: Vec::new(),
                stats: SinkStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn ingest_event(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.stats.total_events += 1;
        match serde_json::to_string(envelope) {
            Ok(line) => {
                inner.buffered.push(BufferedLine {
                    file_key: envelope.run_id.clone(),
                    line,
                    is_event: true,
                });
                Ok(())
            }
            Err(err) => {
                inner.stats.events_dropped += 1;
                Err(SinkError::Droppable(format!("serialize event: {err}")))
            }
        }
    }

    async fn ingest_chunk(&self, chunk: &ArtifactChunk) -> Result<(), SinkError> {
        // Chunk receipts are recorded without their bytes; the reassembled
        // artifact is the file writer's concern.
        let record = serde_json::json!({
            "record": "artifact_chunk",
            "artifact_id": chunk.artifact_id,
            "seq": chunk.seq,
            "is_last": chunk.is_last,
            "len": chunk.data.len(),
        });
        // Chunks have no run id of their own; file them under the artifact.
        self.lock().buffered.push(BufferedLine {
            file_key: format!("artifact-{}", chunk.artifact_id),
            line: record.to_string(),
            is_event: false,
        });
        Ok(())
    }

    async fn flush(&self, trigger: &str) -> Result<(), SinkError> {
        let (batch, root) = {
            let mut inner = self.lock();
            *inner
                .stats
                .flush_triggers
                .entry(trigger.to_string())
                .or_insert(0) += 1;
            (std::mem::take(&mut inner.buffered), self.root.clone())
        };
        if batch.is_empty() {
            return Ok(());
        }

        let event_count = batch.iter().filter(|entry| entry.is_event).count() as u64;
        let lines: Vec<(String, String)> = batch
            .iter()
            .map(|entry| (entry.file_key.clone(), entry.line.clone()))
            .collect();
        let written = tokio::task::spawn_blocking(move || append_batch(&root, &lines))
            .await
            .map_err(|err| SinkError::Fatal(format!("flush task: {err}")))?;

        match written {
            Ok(()) => {
                self.lock().stats.events_persisted += event_count;
                Ok(())
            }
            Err(err) => {
                // Keep the batch for the next flush attempt.
                let mut inner = self.lock();
                let mut batch = batch;
                batch.extend(std::mem::take(&mut inner.buffered));
                inner.buffered = batch;
                Err(SinkError::Fatal(format!("flush events: {err:#}")))
            }
        }
    }

    fn stats(&self) -> SinkStats {
        self.lock().stats.clone()
    }
}

fn append_batch(root: &Path, batch: &[(String, String)]) -> anyhow::Result<()> {
    use std::io::Write;

    let dir = root.join("events");
    std::fs::create_dir_all(&dir)?;

    let mut grouped: HashMap<&str, Vec<&str>> = HashMap::new();
    for (run_id, line) in batch {
        grouped.entry(run_id).or_default().push(line);
    }

    for (run_id, lines) in grouped {
        let path = dir.join(format!("{run_id}.jsonl"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        file.sync_data()?;
    }
    Ok(())
}
