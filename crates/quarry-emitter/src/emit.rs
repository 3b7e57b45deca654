use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use quarry_core::JobInput;
use quarry_wire::{
    chunk_plan, write_frame, ArtifactChunk, EventEnvelope, EventType, FileWrite, Frame, ProxyUsed,
    RunResultFrame, ScriptOutcome, ScriptStatus, WireError, CONTRACT_VERSION,
};

use crate::ack::{AckError, AckHandle};

/// Failures surfaced to the user script.
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    /// A non-terminal event was emitted after the terminal. This is a
    /// programming error in the script.
    #[error("event emitted after terminal")]
    AfterTerminal,
    /// Framing or serialization failed.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// A sidecar file write was not acknowledged as persisted.
    #[error(transparent)]
    Ack(#[from] AckError),
}

/// Emits framed events on behalf of a user script.
///
/// Back-pressure is the writer's: every frame write is awaited to completion
/// and flushed, so a full pipe suspends the script instead of buffering
/// without bound.
pub struct Emitter<W> {
    out: W,
    run_id: String,
    attempt: u32,
    job_id: Option<String>,
    parent_run_id: Option<String>,
    seq: i64,
    event_counter: u64,
    terminal_sent: bool,
    next_write_id: u64,
    acks: AckHandle,
}

impl<W> Emitter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Build an emitter stamped with the run's identity.
    pub fn new(input: &JobInput, out: W, acks: AckHandle) -> Self {
        Emitter {
            out,
            run_id: input.run_id.clone(),
            attempt: input.attempt,
            job_id: input.job_id.clone(),
            parent_run_id: input.parent_run_id.clone(),
            seq: 0,
            event_counter: 0,
            terminal_sent: false,
            next_write_id: 0,
            acks,
        }
    }

    /// Whether the terminal event has been emitted.
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    /// Emit a scraped item.
    pub async fn item(
        &mut self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EmitError> {
        self.emit_event(EventType::Item, payload).await
    }

    /// Emit a log line.
    pub async fn log(&mut self, level: &str, message: &str) -> Result<(), EmitError> {
        let mut payload = serde_json::Map::new();
        payload.insert("level".to_string(), serde_json::json!(level));
        payload.insert("message".to_string(), serde_json::json!(message));
        self.emit_event(EventType::Log, payload).await
    }

    /// Emit a progress checkpoint.
    pub async fn checkpoint(
        &mut self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EmitError> {
        self.emit_event(EventType::Checkpoint, payload).await
    }

    /// Ask the supervisor to schedule derived work.
    pub async fn enqueue(
        &mut self,
        target: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EmitError> {
        self.enqueue_with_hints(target, params, None, None).await
    }

    /// [`Emitter::enqueue`] with partition hints attached.
    pub async fn enqueue_with_hints(
        &mut self,
        target: &str,
        params: serde_json::Map<String, serde_json::Value>,
        source: Option<&str>,
        category: Option<&str>,
    ) -> Result<(), EmitError> {
        let mut payload = serde_json::Map::new();
        payload.insert("target".to_string(), serde_json::json!(target));
        payload.insert("params".to_string(), serde_json::Value::Object(params));
        if let Some(source) = source {
            payload.insert("source".to_string(), serde_json::json!(source));
        }
        if let Some(category) = category {
            payload.insert("category".to_string(), serde_json::json!(category));
        }
        self.emit_event(EventType::Enqueue, payload).await
    }

    /// Stream a binary artifact as chunk frames followed by its commit
    /// envelope carrying the declared size.
    pub async fn artifact(
        &mut self,
        artifact_id: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), EmitError> {
        if self.terminal_sent {
            return Err(EmitError::AfterTerminal);
        }
        for span in chunk_plan(data.len()) {
            let chunk = ArtifactChunk {
                artifact_id: artifact_id.to_string(),
                seq: span.seq,
                is_last: span.is_last,
                data: data[span.offset..span.offset + span.len].to_vec(),
            };
            write_frame(&mut self.out, &Frame::ArtifactChunk(chunk)).await?;
        }
        let mut payload = serde_json::Map::new();
        payload.insert("artifact_id".to_string(), serde_json::json!(artifact_id));
        payload.insert("content_type".to_string(), serde_json::json!(content_type));
        payload.insert("size_bytes".to_string(), serde_json::json!(data.len()));
        self.emit_event(EventType::Artifact, payload).await
    }

    /// Emit the `run_complete` terminal. Further terminals are silently
    /// dropped.
    pub async fn run_complete(
        &mut self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EmitError> {
        self.emit_event(EventType::RunComplete, payload).await
    }

    /// Emit the `run_error` terminal with error context.
    pub async fn run_error(
        &mut self,
        message: &str,
        error_type: Option<&str>,
        stack: Option<&str>,
    ) -> Result<(), EmitError> {
        let mut payload = serde_json::Map::new();
        payload.insert("message".to_string(), serde_json::json!(message));
        if let Some(error_type) = error_type {
            payload.insert("error_type".to_string(), serde_json::json!(error_type));
        }
        if let Some(stack) = stack {
            payload.insert("stack".to_string(), serde_json::json!(stack));
        }
        self.emit_event(EventType::RunError, payload).await
    }

    /// Send the run-result control frame. Allowed after the terminal; does
    /// not consume a sequence number.
    pub async fn send_result(
        &mut self,
        status: ScriptStatus,
        message: Option<&str>,
        error_type: Option<&str>,
        stack: Option<&str>,
        proxy_used: Option<ProxyUsed>,
    ) -> Result<(), EmitError> {
        let frame = Frame::RunResult(RunResultFrame {
            outcome: ScriptOutcome {
                status,
                message: message.map(str::to_string),
                error_type: error_type.map(str::to_string),
                stack: stack.map(str::to_string),
            },
            proxy_used,
        });
        write_frame(&mut self.out, &frame).await?;
        Ok(())
    }

    /// Persist a sidecar file through the supervisor and suspend until it
    /// is acknowledged. An `ok = false` ack surfaces the carried error.
    pub async fn write_file(
        &mut self,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<(), EmitError> {
        self.next_write_id += 1;
        let write_id = self.next_write_id;
        // Register before sending so the ack cannot race the waiter.
        let waiter = self.acks.register(write_id);
        let frame = Frame::FileWrite(FileWrite {
            write_id,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            data: data.to_vec(),
        });
        if let Err(err) = write_frame(&mut self.out, &frame).await {
            self.acks.discard(write_id);
            return Err(err.into());
        }
        waiter.wait().await?;
        Ok(())
    }

    /// Drain the output so every buffered frame is visible to the reader.
    /// Call before process exit; a dropped terminal frame is the most common
    /// cause of spurious crash classifications.
    pub async fn finish(mut self) -> Result<(), EmitError> {
        self.out.flush().await.map_err(WireError::from)?;
        Ok(())
    }

    async fn emit_event(
        &mut self,
        kind: EventType,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EmitError> {
        if self.terminal_sent {
            if kind.is_terminal() {
                return Ok(());
            }
            return Err(EmitError::AfterTerminal);
        }
        self.seq += 1;
        self.event_counter += 1;
        let env = EventEnvelope {
            contract_version: CONTRACT_VERSION.to_string(),
            event_id: format!("{}-ev{}", self.run_id, self.event_counter),
            run_id: self.run_id.clone(),
            attempt: self.attempt,
            seq: self.seq,
            kind,
            ts: Utc::now().to_rfc3339(),
            job_id: self.job_id.clone(),
            parent_run_id: self.parent_run_id.clone(),
            payload,
        };
        write_frame(&mut self.out, &Frame::Event(env)).await?;
        if kind.is_terminal() {
            self.terminal_sent = true;
        }
        Ok(())
    }
}
