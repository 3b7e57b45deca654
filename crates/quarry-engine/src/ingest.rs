use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use quarry_core::{EventSink, FileWriter};
use quarry_wire::{
    read_frame, write_frame, EventEnvelope, EventType, FileWriteAck, Frame, RunResultFrame,
    CONTRACT_VERSION, MAX_CHUNK_SIZE,
};

use crate::artifact::ArtifactStore;
use crate::executor::SharedWriter;

/// Callback invoked synchronously on every `enqueue` envelope, before the
/// event reaches the sink.
pub type EnqueueObserver = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Classification of an ingestion failure; drives outcome mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestErrorKind {
    /// Malformed framing, envelope violations, sequence gaps, artifact
    /// rejections, or EOF before the terminal event.
    Stream,
    /// The sink reported a fatal error.
    Policy,
    /// The child speaks a different contract version.
    VersionMismatch,
    /// The supervisor's context was canceled.
    Canceled,
}

/// An ingestion failure with its kind attached.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct IngestError {
    /// Failure classification.
    pub kind: IngestErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl IngestError {
    pub(crate) fn stream(message: impl Into<String>) -> Self {
        IngestError {
            kind: IngestErrorKind::Stream,
            message: message.into(),
        }
    }

    pub(crate) fn policy(message: impl Into<String>) -> Self {
        IngestError {
            kind: IngestErrorKind::Policy,
            message: message.into(),
        }
    }

    fn version(message: impl Into<String>) -> Self {
        IngestError {
            kind: IngestErrorKind::VersionMismatch,
            message: message.into(),
        }
    }

    fn canceled() -> Self {
        IngestError {
            kind: IngestErrorKind::Canceled,
            message: "ingestion canceled".to_string(),
        }
    }
}

/// What ingestion observed, error or not.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// First terminal envelope, if one arrived.
    pub terminal: Option<EventEnvelope>,
    /// First run-result control frame, if one arrived.
    pub run_result: Option<RunResultFrame>,
    /// Envelopes accepted past all invariants.
    pub events_accepted: u64,
    /// Artifact chunks accepted.
    pub chunks_accepted: u64,
}

/// Reads frames from one child's output until end-of-stream or a fatal
/// error, dispatching to the sink, the artifact store, the enqueue observer,
/// and the sidecar file writer.
pub struct IngestEngine {
    run_id: String,
    attempt: u32,
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    acks: SharedWriter,
    sink: Arc<dyn EventSink>,
    files: Option<Arc<dyn FileWriter>>,
    artifacts: Arc<ArtifactStore>,
    observer: Option<EnqueueObserver>,
    cancel: CancellationToken,
    seq: i64,
    report: IngestReport,
}

impl IngestEngine {
    /// Wire up ingestion for one run.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: String,
        attempt: u32,
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        acks: SharedWriter,
        sink: Arc<dyn EventSink>,
        files: Option<Arc<dyn FileWriter>>,
        artifacts: Arc<ArtifactStore>,
        observer: Option<EnqueueObserver>,
        cancel: CancellationToken,
    ) -> Self {
        IngestEngine {
            run_id,
            attempt,
            reader,
            acks,
            sink,
            files,
            artifacts,
            observer,
            cancel,
            seq: 0,
            report: IngestReport::default(),
        }
    }

    /// Consume the stream to completion. The report is returned on every
    /// path so the orchestrator can classify partial runs.
    pub async fn run(mut self) -> (IngestReport, Result<(), IngestError>) {
        let res = self.run_inner().await;
        (self.report, res)
    }

    async fn run_inner(&mut self) -> Result<(), IngestError> {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::canceled()),
                res = read_frame(&mut self.reader) => match res {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        if self.report.terminal.is_some() {
                            return Ok(());
                        }
                        return Err(IngestError::stream("pipe closed before terminal event"));
                    }
                    Err(err) => return Err(IngestError::stream(format!("read frame: {err}"))),
                },
            };

            let frame = Frame::from_payload(&payload)
                .map_err(|err| IngestError::stream(format!("decode frame: {err}")))?;
            match frame {
                Frame::Event(env) => self.on_event(env).await?,
                Frame::ArtifactChunk(chunk) => {
                    if chunk.seq < 1 {
                        return Err(IngestError::stream(format!(
                            "artifact {:?}: chunk seq must be >= 1",
                            chunk.artifact_id
                        )));
                    }
                    self.artifacts
                        .add_chunk(&chunk)
                        .map_err(|err| IngestError::stream(err.to_string()))?;
                    match self.sink.ingest_chunk(&chunk).await {
                        Ok(()) => {}
                        Err(err) if err.is_droppable() => {
                            tracing::debug!(run_id = %self.run_id, error = %err, "sink dropped chunk");
                        }
                        Err(err) => return Err(IngestError::policy(err.to_string())),
                    }
                    self.report.chunks_accepted += 1;
                }
                Frame::RunResult(frame) => {
                    if self.report.run_result.is_none() {
                        self.report.run_result = Some(frame);
                    } else {
                        tracing::warn!(
                            run_id = %self.run_id,
                            "duplicate run result frame; keeping the first"
                        );
                    }
                }
                Frame::FileWrite(fw) => self.on_file_write(fw).await?,
                Frame::FileWriteAck(_) => {
                    return Err(IngestError::stream(
                        "unexpected file_write_ack frame from child",
                    ));
                }
            }
        }
    }

    async fn on_event(&mut self, env: EventEnvelope) -> Result<(), IngestError> {
        if env.contract_version != CONTRACT_VERSION {
            return Err(IngestError::version(format!(
                "envelope contract version {:?}, supervisor speaks {:?}",
                env.contract_version, CONTRACT_VERSION
            )));
        }
        if env.run_id != self.run_id {
            return Err(IngestError::stream(format!(
                "envelope run_id {:?} does not match run {:?}",
                env.run_id, self.run_id
            )));
        }
        if env.attempt != self.attempt {
            return Err(IngestError::stream(format!(
                "envelope attempt {} does not match run attempt {}",
                env.attempt, self.attempt
            )));
        }
        if env.seq != self.seq + 1 {
            return Err(IngestError::stream(format!(
                "envelope seq {} violates ordering (expected {})",
                env.seq,
                self.seq + 1
            )));
        }
        self.seq = env.seq;

        if env.kind == EventType::Artifact {
            let artifact_id = env
                .payload_str("artifact_id")
                .ok_or_else(|| IngestError::stream("artifact event missing artifact_id"))?;
            let size_bytes = env
                .payload
                .get("size_bytes")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| IngestError::stream("artifact event missing size_bytes"))?;
            self.artifacts
                .commit(artifact_id, size_bytes)
                .map_err(|err| IngestError::stream(err.to_string()))?;
        }

        if env.kind == EventType::Enqueue {
            if let Some(observer) = &self.observer {
                observer(&env);
            }
        }

        if env.is_terminal() {
            if self.report.terminal.is_none() {
                self.report.terminal = Some(env.clone());
            } else {
                tracing::warn!(
                    run_id = %self.run_id,
                    seq = env.seq,
                    kind = env.kind.as_tag(),
                    "duplicate terminal event; keeping the first"
                );
            }
        }

        match self.sink.ingest_event(&env).await {
            Ok(()) => {}
            Err(err) if err.is_droppable() => {
                tracing::debug!(run_id = %self.run_id, error = %err, "sink dropped event");
            }
            Err(err) => return Err(IngestError::policy(err.to_string())),
        }
        self.report.events_accepted += 1;
        Ok(())
    }

    async fn on_file_write(&mut self, fw: quarry_wire::FileWrite) -> Result<(), IngestError> {
        if let Err(reason) = validate_filename(&fw.filename) {
            self.send_ack(fw.write_id, Some(reason)).await;
            return Ok(());
        }
        if fw.data.len() > MAX_CHUNK_SIZE {
            self.send_ack(
                fw.write_id,
                Some(format!(
                    "file too large ({} bytes, max {MAX_CHUNK_SIZE})",
                    fw.data.len()
                )),
            )
            .await;
            return Ok(());
        }
        if self.report.terminal.is_some() {
            tracing::warn!(
                run_id = %self.run_id,
                filename = %fw.filename,
                "file write after terminal event; dropping"
            );
            self.send_ack(fw.write_id, Some("file write after terminal event".to_string()))
                .await;
            return Ok(());
        }
        let Some(files) = &self.files else {
            return Err(IngestError::stream(
                "file write received but no file writer is configured",
            ));
        };
        let error = match files.put(&fw.filename, &fw.content_type, &fw.data).await {
            Ok(()) => None,
            Err(err) => Some(format!("{err:#}")),
        };
        self.send_ack(fw.write_id, error).await;
        Ok(())
    }

    /// Ack delivery failures are non-fatal: the child may already be gone.
    async fn send_ack(&self, write_id: u64, error: Option<String>) {
        let frame = Frame::FileWriteAck(FileWriteAck {
            write_id,
            ok: error.is_none(),
            error,
        });
        let mut writer = self.acks.lock().await;
        if let Err(err) = write_frame(&mut *writer, &frame).await {
            tracing::warn!(
                run_id = %self.run_id,
                write_id,
                error = %err,
                "failed to deliver file write ack"
            );
        }
    }
}

fn validate_filename(filename: &str) -> Result<(), String> {
    if filename.is_empty() {
        return Err("filename must not be empty".to_string());
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(format!("filename {filename:?} contains a path separator"));
    }
    if filename.contains("..") {
        return Err(format!("filename {filename:?} contains '..'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use quarry_core::{SinkError, SinkStats};
    use quarry_wire::{ArtifactChunk, FileWrite, ScriptOutcome, ScriptStatus};

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<EventEnvelope>>,
        chunks: StdMutex<Vec<ArtifactChunk>>,
        flushes: AtomicU64,
        fatal_on_seq: Option<i64>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn ingest_event(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
            if Some(envelope.seq) == self.fatal_on_seq {
                return Err(SinkError::Fatal("simulated sink outage".to_string()));
            }
            self.events.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        async fn ingest_chunk(&self, chunk: &ArtifactChunk) -> Result<(), SinkError> {
            self.chunks.lock().unwrap().push(chunk.clone());
            Ok(())
        }

        async fn flush(&self, _trigger: &str) -> Result<(), SinkError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stats(&self) -> SinkStats {
            SinkStats::default()
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        files: StdMutex<Vec<(String, String, Vec<u8>)>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl FileWriter for RecordingWriter {
        async fn put(&self, filename: &str, content_type: &str, data: &[u8]) -> anyhow::Result<()> {
            if let Some(message) = &self.fail_with {
                anyhow::bail!("{message}");
            }
            self.files.lock().unwrap().push((
                filename.to_string(),
                content_type.to_string(),
                data.to_vec(),
            ));
            Ok(())
        }
    }

    fn envelope(seq: i64, kind: EventType) -> EventEnvelope {
        EventEnvelope {
            contract_version: CONTRACT_VERSION.to_string(),
            event_id: format!("ev-{seq}"),
            run_id: "run-1".to_string(),
            attempt: 1,
            seq,
            kind,
            ts: "2026-01-01T00:00:00Z".to_string(),
            job_id: None,
            parent_run_id: None,
            payload: serde_json::Map::new(),
        }
    }

    async fn frames_to_bytes(frames: &[Frame]) -> Vec<u8> {
        let mut buf = Vec::new();
        for frame in frames {
            write_frame(&mut buf, frame).await.unwrap();
        }
        buf
    }

    struct Harness {
        sink: Arc<RecordingSink>,
        files: Option<Arc<RecordingWriter>>,
        artifacts: Arc<ArtifactStore>,
        ack_rx: tokio::io::DuplexStream,
        engine: IngestEngine,
    }

    fn harness(stream: Vec<u8>, sink: RecordingSink, files: Option<RecordingWriter>) -> Harness {
        let (ack_tx, ack_rx) = tokio::io::duplex(64 * 1024);
        let acks: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(ack_tx)));
        let sink = Arc::new(sink);
        let files = files.map(Arc::new);
        let artifacts = Arc::new(ArtifactStore::new());
        let engine = IngestEngine::new(
            "run-1".to_string(),
            1,
            Box::new(std::io::Cursor::new(stream)),
            acks,
            sink.clone(),
            files
                .clone()
                .map(|w| w as Arc<dyn FileWriter>),
            artifacts.clone(),
            None,
            CancellationToken::new(),
        );
        Harness {
            sink,
            files,
            artifacts,
            ack_rx,
            engine,
        }
    }

    async fn next_ack(reader: &mut tokio::io::DuplexStream) -> FileWriteAck {
        let payload = read_frame(reader).await.unwrap().unwrap();
        match Frame::from_payload(&payload).unwrap() {
            Frame::FileWriteAck(ack) => ack,
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepts_ordered_stream_and_records_terminal() {
        let stream = frames_to_bytes(&[
            Frame::Event(envelope(1, EventType::Item)),
            Frame::Event(envelope(2, EventType::RunComplete)),
        ])
        .await;
        let h = harness(stream, RecordingSink::default(), None);
        let (report, res) = h.engine.run().await;
        res.unwrap();
        assert_eq!(report.events_accepted, 2);
        assert_eq!(
            report.terminal.as_ref().map(|t| t.kind),
            Some(EventType::RunComplete)
        );
        assert_eq!(h.sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sequence_gap_is_a_stream_error() {
        let stream = frames_to_bytes(&[
            Frame::Event(envelope(1, EventType::Item)),
            Frame::Event(envelope(3, EventType::Item)),
        ])
        .await;
        let h = harness(stream, RecordingSink::default(), None);
        let (_, res) = h.engine.run().await;
        let err = res.unwrap_err();
        assert_eq!(err.kind, IngestErrorKind::Stream);
        assert!(err.message.contains("seq 3"));
    }

    #[tokio::test]
    async fn run_result_does_not_advance_seq() {
        let stream = frames_to_bytes(&[
            Frame::Event(envelope(1, EventType::Item)),
            Frame::RunResult(RunResultFrame {
                outcome: ScriptOutcome {
                    status: ScriptStatus::Completed,
                    message: None,
                    error_type: None,
                    stack: None,
                },
                proxy_used: None,
            }),
            Frame::Event(envelope(2, EventType::RunComplete)),
        ])
        .await;
        let h = harness(stream, RecordingSink::default(), None);
        let (report, res) = h.engine.run().await;
        res.unwrap();
        assert_eq!(report.events_accepted, 2);
        assert!(report.run_result.is_some());
    }

    #[tokio::test]
    async fn first_terminal_wins_but_later_ones_reach_the_sink() {
        let mut complete = envelope(1, EventType::RunComplete);
        complete
            .payload
            .insert("first".to_string(), serde_json::json!(true));
        let stream = frames_to_bytes(&[
            Frame::Event(complete),
            Frame::Event(envelope(2, EventType::RunError)),
        ])
        .await;
        let h = harness(stream, RecordingSink::default(), None);
        let (report, res) = h.engine.run().await;
        res.unwrap();
        let terminal = report.terminal.unwrap();
        assert_eq!(terminal.kind, EventType::RunComplete);
        assert_eq!(terminal.seq, 1);
        assert_eq!(h.sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn version_mismatch_has_its_own_kind() {
        let mut env = envelope(1, EventType::Item);
        env.contract_version = "999".to_string();
        let stream = frames_to_bytes(&[Frame::Event(env)]).await;
        let h = harness(stream, RecordingSink::default(), None);
        let (_, res) = h.engine.run().await;
        assert_eq!(res.unwrap_err().kind, IngestErrorKind::VersionMismatch);
    }

    #[tokio::test]
    async fn eof_before_terminal_is_a_stream_error() {
        let stream = frames_to_bytes(&[Frame::Event(envelope(1, EventType::Item))]).await;
        let h = harness(stream, RecordingSink::default(), None);
        let (report, res) = h.engine.run().await;
        let err = res.unwrap_err();
        assert_eq!(err.kind, IngestErrorKind::Stream);
        assert!(err.message.contains("pipe closed"));
        assert_eq!(report.events_accepted, 1);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_stream_error() {
        let mut stream = frames_to_bytes(&[
            Frame::Event(envelope(1, EventType::Item)),
            Frame::Event(envelope(2, EventType::Item)),
            Frame::Event(envelope(3, EventType::Item)),
        ])
        .await;
        // Announce a 100-byte frame, deliver 2 bytes, close the pipe.
        stream.extend_from_slice(&100u32.to_be_bytes());
        stream.extend_from_slice(&[0xaa, 0xbb]);
        let h = harness(stream, RecordingSink::default(), None);
        let (report, res) = h.engine.run().await;
        assert_eq!(res.unwrap_err().kind, IngestErrorKind::Stream);
        assert_eq!(report.events_accepted, 3);
    }

    #[tokio::test]
    async fn fatal_sink_error_is_a_policy_error() {
        let stream = frames_to_bytes(&[Frame::Event(envelope(1, EventType::Item))]).await;
        let sink = RecordingSink {
            fatal_on_seq: Some(1),
            ..RecordingSink::default()
        };
        let h = harness(stream, sink, None);
        let (_, res) = h.engine.run().await;
        assert_eq!(res.unwrap_err().kind, IngestErrorKind::Policy);
    }

    #[tokio::test]
    async fn artifact_chunks_and_commit_flow_through() {
        let mut commit = envelope(1, EventType::Artifact);
        commit
            .payload
            .insert("artifact_id".to_string(), serde_json::json!("shot-1"));
        commit
            .payload
            .insert("size_bytes".to_string(), serde_json::json!(4));
        let stream = frames_to_bytes(&[
            Frame::ArtifactChunk(ArtifactChunk {
                artifact_id: "shot-1".to_string(),
                seq: 1,
                is_last: true,
                data: vec![1, 2, 3, 4],
            }),
            Frame::Event(commit),
            Frame::Event(envelope(2, EventType::RunComplete)),
        ])
        .await;
        let h = harness(stream, RecordingSink::default(), None);
        let artifacts = h.artifacts.clone();
        let (report, res) = h.engine.run().await;
        res.unwrap();
        assert_eq!(report.chunks_accepted, 1);
        assert_eq!(artifacts.stats().committed, 1);
        assert_eq!(h.sink.chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_observer_runs_before_sink_dispatch() {
        let mut enqueue = envelope(1, EventType::Enqueue);
        enqueue
            .payload
            .insert("target".to_string(), serde_json::json!("scripts/detail.js"));
        let stream = frames_to_bytes(&[
            Frame::Event(enqueue),
            Frame::Event(envelope(2, EventType::RunComplete)),
        ])
        .await;
        let mut h = harness(stream, RecordingSink::default(), None);
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_in_observer = seen.clone();
        let sink_for_check = h.sink.clone();
        h.engine.observer = Some(Arc::new(move |env: &EventEnvelope| {
            // The sink must not have seen this envelope yet.
            assert!(sink_for_check.events.lock().unwrap().is_empty());
            seen_in_observer
                .lock()
                .unwrap()
                .push(env.payload_str("target").unwrap_or_default().to_string());
        }));
        let (_, res) = h.engine.run().await;
        res.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["scripts/detail.js"]);
    }

    #[tokio::test]
    async fn file_write_acks_success_and_failure() {
        let stream = frames_to_bytes(&[
            Frame::FileWrite(FileWrite {
                write_id: 1,
                filename: "page.html".to_string(),
                content_type: "text/html".to_string(),
                data: b"<html/>".to_vec(),
            }),
            Frame::Event(envelope(1, EventType::RunComplete)),
        ])
        .await;
        let mut h = harness(stream, RecordingSink::default(), Some(RecordingWriter::default()));
        let files = h.files.clone().unwrap();
        let (_, res) = h.engine.run().await;
        res.unwrap();
        let ack = next_ack(&mut h.ack_rx).await;
        assert_eq!(ack.write_id, 1);
        assert!(ack.ok);
        assert_eq!(files.files.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_file_write_acks_error_and_run_continues() {
        let stream = frames_to_bytes(&[
            Frame::FileWrite(FileWrite {
                write_id: 2,
                filename: "page.html".to_string(),
                content_type: "text/html".to_string(),
                data: b"<html/>".to_vec(),
            }),
            Frame::Event(envelope(1, EventType::RunComplete)),
        ])
        .await;
        let writer = RecordingWriter {
            fail_with: Some("disk full".to_string()),
            ..RecordingWriter::default()
        };
        let mut h = harness(stream, RecordingSink::default(), Some(writer));
        let (report, res) = h.engine.run().await;
        res.unwrap();
        assert!(report.terminal.is_some());
        let ack = next_ack(&mut h.ack_rx).await;
        assert_eq!(ack.write_id, 2);
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn file_write_with_bad_filename_is_refused_via_ack() {
        for filename in ["", "a/b.html", "..secret", "c\\d"] {
            let stream = frames_to_bytes(&[
                Frame::FileWrite(FileWrite {
                    write_id: 9,
                    filename: filename.to_string(),
                    content_type: "text/html".to_string(),
                    data: b"x".to_vec(),
                }),
                Frame::Event(envelope(1, EventType::RunComplete)),
            ])
            .await;
            let mut h = harness(stream, RecordingSink::default(), Some(RecordingWriter::default()));
            let files = h.files.clone().unwrap();
            let (_, res) = h.engine.run().await;
            res.unwrap();
            let ack = next_ack(&mut h.ack_rx).await;
            assert!(!ack.ok, "filename {filename:?} should be refused");
            assert!(files.files.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn file_write_after_terminal_is_refused() {
        let stream = frames_to_bytes(&[
            Frame::Event(envelope(1, EventType::RunComplete)),
            Frame::FileWrite(FileWrite {
                write_id: 3,
                filename: "late.html".to_string(),
                content_type: "text/html".to_string(),
                data: b"x".to_vec(),
            }),
        ])
        .await;
        let mut h = harness(stream, RecordingSink::default(), Some(RecordingWriter::default()));
        let files = h.files.clone().unwrap();
        let (_, res) = h.engine.run().await;
        res.unwrap();
        let ack = next_ack(&mut h.ack_rx).await;
        assert!(!ack.ok);
        assert!(files.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_write_without_writer_fails_the_stream() {
        let stream = frames_to_bytes(&[Frame::FileWrite(FileWrite {
            write_id: 1,
            filename: "page.html".to_string(),
            content_type: "text/html".to_string(),
            data: b"x".to_vec(),
        })])
        .await;
        let h = harness(stream, RecordingSink::default(), None);
        let (_, res) = h.engine.run().await;
        let err = res.unwrap_err();
        assert_eq!(err.kind, IngestErrorKind::Stream);
        assert!(err.message.contains("no file writer"));
    }

    #[tokio::test]
    async fn cancellation_surfaces_its_own_kind() {
        // An open duplex with no data keeps the reader pending.
        let (_child_out, supervisor_in) = tokio::io::duplex(1024);
        let (ack_tx, _ack_rx) = tokio::io::duplex(1024);
        let acks: SharedWriter = Arc::new(tokio::sync::Mutex::new(Box::new(ack_tx)));
        let cancel = CancellationToken::new();
        let engine = IngestEngine::new(
            "run-1".to_string(),
            1,
            Box::new(supervisor_in),
            acks,
            Arc::new(RecordingSink::default()),
            None,
            Arc::new(ArtifactStore::new()),
            None,
            cancel.clone(),
        );
        cancel.cancel();
        let (_, res) = engine.run().await;
        assert_eq!(res.unwrap_err().kind, IngestErrorKind::Canceled);
    }

    #[tokio::test]
    async fn mismatched_run_identity_is_a_stream_error() {
        let mut env = envelope(1, EventType::Item);
        env.run_id = "someone-else".to_string();
        let stream = frames_to_bytes(&[Frame::Event(env)]).await;
        let h = harness(stream, RecordingSink::default(), None);
        let (_, res) = h.engine.run().await;
        assert_eq!(res.unwrap_err().kind, IngestErrorKind::Stream);
    }
}
