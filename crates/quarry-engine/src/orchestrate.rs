use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use quarry_core::{
    ArtifactStats, EventSink, FileWriter, JobInput, RunOutcome, RunResult, RunSpec, SinkError,
};
use quarry_wire::{EventType, ScriptStatus};

use crate::artifact::ArtifactStore;
use crate::executor::{Executor, ExitReport};
use crate::ingest::{EnqueueObserver, IngestEngine, IngestError, IngestErrorKind, IngestReport};

/// Bound on the post-run sink flush.
pub(crate) const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes single runs end-to-end: spawn, ingest, reap, flush, classify.
pub struct Orchestrator {
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    /// Wire an orchestrator to its collaborators.
    pub fn new(executor: Arc<dyn Executor>, sink: Arc<dyn EventSink>) -> Self {
        Orchestrator { executor, sink }
    }

    /// Run one child to completion and classify the outcome. `files` is the
    /// run's partition-bound sidecar writer, if one is configured.
    ///
    /// The sink is flushed exactly once on every termination path except
    /// metadata rejection, which never starts a run.
    pub async fn run(
        &self,
        spec: &RunSpec,
        files: Option<Arc<dyn FileWriter>>,
        observer: Option<EnqueueObserver>,
        cancel: &CancellationToken,
    ) -> RunResult {
        let started = Instant::now();

        if let Err(err) = spec.validate() {
            return RunResult {
                run_id: spec.run_id.clone(),
                job_id: spec.job_id.clone(),
                attempt: spec.attempt,
                outcome: RunOutcome::InvalidMetadata,
                message: format!("invalid run metadata: {err}"),
                error_type: None,
                stack: None,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                sink: self.sink.stats(),
                artifacts: ArtifactStats::default(),
                orphan_artifacts: Vec::new(),
                stderr: String::new(),
                proxy: spec.proxy.as_ref().map(|p| p.redacted()),
            };
        }

        let input = JobInput::from_spec(spec);
        let child = match self.executor.start(&input).await {
            Ok(child) => child,
            Err(err) => {
                let flush_err = self.flush("launch_failure").await.err();
                let mut message = format!("executor failed to launch: {err:#}");
                if let Some(flush_err) = flush_err {
                    message = format!("{message}; sink flush also failed: {flush_err}");
                }
                return RunResult {
                    run_id: spec.run_id.clone(),
                    job_id: spec.job_id.clone(),
                    attempt: spec.attempt,
                    outcome: RunOutcome::ExecutorCrash,
                    message,
                    error_type: None,
                    stack: None,
                    exit_code: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    sink: self.sink.stats(),
                    artifacts: ArtifactStats::default(),
                    orphan_artifacts: Vec::new(),
                    stderr: String::new(),
                    proxy: spec.proxy.as_ref().map(|p| p.redacted()),
                };
            }
        };

        let artifacts = Arc::new(ArtifactStore::new());
        let engine = IngestEngine::new(
            spec.run_id.clone(),
            spec.attempt,
            child.stdout,
            child.stdin.clone(),
            self.sink.clone(),
            files,
            artifacts.clone(),
            observer,
            cancel.clone(),
        );

        // Ingestion must finish before the child is reaped: reaping closes
        // the read end of the stdout pipe under the ingestion reader.
        let ingest_task = tokio::spawn(engine.run());
        let (report, ingest_res) = match ingest_task.await {
            Ok(pair) => pair,
            Err(err) => (
                IngestReport::default(),
                Err(IngestError::stream(format!("ingestion task failed: {err}"))),
            ),
        };

        let mut handle = child.handle;
        if ingest_res.is_err() {
            // Stop further emissions before reaping.
            handle.kill().await;
        }
        let exit = handle.wait().await;

        let flush_err = self.flush("run_end").await.err();

        let (outcome, message, error_type, stack) =
            classify(&exit, ingest_res.as_ref().err(), &report);
        let (outcome, message) = apply_flush_failure(outcome, message, flush_err);

        let stderr = match &exit {
            Ok(report) => String::from_utf8_lossy(&report.stderr).into_owned(),
            Err(_) => String::new(),
        };

        RunResult {
            run_id: spec.run_id.clone(),
            job_id: spec.job_id.clone(),
            attempt: spec.attempt,
            outcome,
            message,
            error_type,
            stack,
            exit_code: exit.as_ref().ok().map(|e| e.code),
            duration_ms: started.elapsed().as_millis() as u64,
            sink: self.sink.stats(),
            artifacts: artifacts.stats(),
            orphan_artifacts: artifacts.orphans(),
            stderr,
            proxy: report
                .run_result
                .and_then(|rr| rr.proxy_used)
                .map(Into::into)
                .or_else(|| spec.proxy.as_ref().map(|p| p.redacted())),
        }
    }

    /// Flush detached from the run's cancellation so shutdown still persists
    /// buffered data, bounded by [`FLUSH_TIMEOUT`].
    async fn flush(&self, trigger: &str) -> Result<(), SinkError> {
        match tokio::time::timeout(FLUSH_TIMEOUT, self.sink.flush(trigger)).await {
            Ok(res) => res,
            Err(_) => Err(SinkError::Fatal(format!(
                "flush timed out after {}s",
                FLUSH_TIMEOUT.as_secs()
            ))),
        }
    }
}

fn status_tag(status: ScriptStatus) -> &'static str {
    match status {
        ScriptStatus::Completed => "completed",
        ScriptStatus::Error => "error",
        ScriptStatus::Crash => "crash",
    }
}

fn script_error_context(report: &IngestReport) -> (String, Option<String>, Option<String>) {
    if let Some(rr) = &report.run_result {
        return (
            rr.outcome
                .message
                .clone()
                .unwrap_or_else(|| "script error".to_string()),
            rr.outcome.error_type.clone(),
            rr.outcome.stack.clone(),
        );
    }
    if let Some(terminal) = &report.terminal {
        return (
            terminal
                .payload_str("message")
                .unwrap_or("script error")
                .to_string(),
            terminal.payload_str("error_type").map(str::to_string),
            terminal.payload_str("stack").map(str::to_string),
        );
    }
    ("script error".to_string(), None, None)
}

/// The exit code owns the outcome category; frames only supply context.
fn classify(
    exit: &anyhow::Result<ExitReport>,
    ingest_err: Option<&IngestError>,
    report: &IngestReport,
) -> (RunOutcome, String, Option<String>, Option<String>) {
    if let Some(err) = ingest_err {
        return match err.kind {
            IngestErrorKind::VersionMismatch => (
                RunOutcome::VersionMismatch,
                format!("contract version mismatch: {err}"),
                None,
                None,
            ),
            IngestErrorKind::Policy => (
                RunOutcome::PolicyFailure,
                format!("sink policy failure: {err}"),
                None,
                None,
            ),
            IngestErrorKind::Canceled => {
                (RunOutcome::ExecutorCrash, format!("run canceled: {err}"), None, None)
            }
            IngestErrorKind::Stream => (
                RunOutcome::ExecutorCrash,
                format!("event stream failed: {err}"),
                None,
                None,
            ),
        };
    }

    let exit = match exit {
        Ok(exit) => exit,
        Err(err) => {
            return (
                RunOutcome::ExecutorCrash,
                format!("failed to reap executor: {err:#}"),
                None,
                None,
            );
        }
    };

    let terminal = report.terminal.as_ref().map(|t| t.kind);
    match exit.code {
        0 => {
            if terminal == Some(EventType::RunComplete) {
                let mut message = "run completed".to_string();
                if let Some(rr) = &report.run_result {
                    if rr.outcome.status != ScriptStatus::Completed {
                        let status = status_tag(rr.outcome.status);
                        tracing::warn!(
                            status,
                            "exit code 0 disagrees with run result frame; keeping success"
                        );
                        message = format!(
                            "run completed (exit code 0) but the run result frame reported {status}"
                        );
                    }
                }
                (RunOutcome::Success, message, None, None)
            } else {
                (
                    RunOutcome::ExecutorCrash,
                    "clean exit without terminal event".to_string(),
                    None,
                    None,
                )
            }
        }
        1 => match terminal {
            Some(EventType::RunError) => {
                let (message, error_type, stack) = script_error_context(report);
                (RunOutcome::ScriptError, message, error_type, stack)
            }
            Some(_) => {
                let frame_status = report
                    .run_result
                    .as_ref()
                    .map(|rr| status_tag(rr.outcome.status))
                    .unwrap_or("none");
                tracing::warn!(
                    frame_status,
                    "exit code 1 disagrees with run_complete terminal; keeping script_error"
                );
                (
                    RunOutcome::ScriptError,
                    format!(
                        "script failed (exit code 1) but the stream reported run_complete \
                         (run result status: {frame_status})"
                    ),
                    None,
                    None,
                )
            }
            None => (
                RunOutcome::ExecutorCrash,
                "exit code 1 without a run_error terminal".to_string(),
                None,
                None,
            ),
        },
        2 => (
            RunOutcome::ExecutorCrash,
            "executor crashed (exit code 2)".to_string(),
            None,
            None,
        ),
        3 => (
            RunOutcome::ExecutorCrash,
            "executor rejected its input (exit code 3)".to_string(),
            None,
            None,
        ),
        other => (
            RunOutcome::ExecutorCrash,
            format!("executor exited with unexpected code {other}"),
            None,
            None,
        ),
    }
}

fn apply_flush_failure(
    outcome: RunOutcome,
    message: String,
    flush_err: Option<SinkError>,
) -> (RunOutcome, String) {
    let Some(err) = flush_err else {
        return (outcome, message);
    };
    if outcome == RunOutcome::Success {
        (RunOutcome::PolicyFailure, format!("sink flush failed: {err}"))
    } else {
        (outcome, format!("{message}; sink flush also failed: {err}"))
    }
}
