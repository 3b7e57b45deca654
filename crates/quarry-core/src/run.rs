use serde::{Deserialize, Serialize};

use crate::proxy::{ProxyConfig, RedactedProxy};
use crate::partition::StoragePartition;
use crate::sink::SinkStats;

/// Metadata rejected before any process is launched.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    /// The run id is empty.
    #[error("run_id must not be empty")]
    EmptyRunId,
    /// The attempt counter is zero.
    #[error("attempt must be >= 1")]
    ZeroAttempt,
    /// A retry attempt without the prior run's id.
    #[error("attempt {attempt} requires a parent_run_id")]
    MissingParentRun {
        /// The offending attempt number.
        attempt: u32,
    },
    /// A first attempt carrying a parent run id.
    #[error("attempt 1 must not carry a parent_run_id")]
    UnexpectedParentRun,
    /// No script target to execute.
    #[error("target must not be empty")]
    EmptyTarget,
}

/// Everything the supervisor needs to execute one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Caller-assigned id, unique per attempt.
    pub run_id: String,
    /// Retry index, 1 for the original attempt.
    pub attempt: u32,
    /// Logical job grouping retries of the same work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Run id of the prior attempt; required iff `attempt > 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Script path the executor runs.
    pub target: String,
    /// Script parameters.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Proxy handed to the child, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    /// Reusable-browser websocket endpoint, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_ws_endpoint: Option<String>,
    /// Storage partition for sidecar files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePartition>,
}

impl RunSpec {
    /// Enforce the identity and lineage rules for run metadata.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.run_id.is_empty() {
            return Err(MetadataError::EmptyRunId);
        }
        if self.attempt == 0 {
            return Err(MetadataError::ZeroAttempt);
        }
        let has_parent = self
            .parent_run_id
            .as_deref()
            .is_some_and(|parent| !parent.is_empty());
        if self.attempt > 1 && !has_parent {
            return Err(MetadataError::MissingParentRun {
                attempt: self.attempt,
            });
        }
        if self.attempt == 1 && self.parent_run_id.is_some() {
            return Err(MetadataError::UnexpectedParentRun);
        }
        if self.target.is_empty() {
            return Err(MetadataError::EmptyTarget);
        }
        Ok(())
    }
}

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Rejected before launch; no process was started.
    InvalidMetadata,
    /// Exit 0 with a `run_complete` terminal.
    Success,
    /// Exit 1 with a `run_error` terminal.
    ScriptError,
    /// The executor died, lied, or never spoke.
    ExecutorCrash,
    /// The sink reported a fatal error or the flush failed.
    PolicyFailure,
    /// The child speaks a different wire contract version.
    VersionMismatch,
}

impl RunOutcome {
    /// Whether the run produced a usable result.
    pub fn is_success(self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    /// Stable label for reports and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::InvalidMetadata => "invalid_metadata",
            RunOutcome::Success => "success",
            RunOutcome::ScriptError => "script_error",
            RunOutcome::ExecutorCrash => "executor_crash",
            RunOutcome::PolicyFailure => "policy_failure",
            RunOutcome::VersionMismatch => "version_mismatch",
        }
    }
}

/// Reassembly statistics for one run's artifacts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactStats {
    /// Accumulators observed (chunks or commits).
    pub artifacts: u64,
    /// Artifacts whose declared size reconciled.
    pub committed: u64,
    /// Accumulators with chunks but no commit.
    pub orphaned: u64,
    /// Total reassembled bytes across all accumulators.
    pub bytes: u64,
}

/// The surfaced result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Caller-assigned run id.
    pub run_id: String,
    /// Logical job id, if any.
    pub job_id: Option<String>,
    /// Retry index.
    pub attempt: u32,
    /// Terminal classification.
    pub outcome: RunOutcome,
    /// Human-readable summary.
    pub message: String,
    /// Error class from the script's `run_error`, if any.
    pub error_type: Option<String>,
    /// Stack trace from the script's `run_error`, if any.
    pub stack: Option<String>,
    /// Child exit code, when a child ran.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Event sink statistics at flush time.
    pub sink: SinkStats,
    /// Artifact reassembly statistics.
    pub artifacts: ArtifactStats,
    /// Ids of artifacts with chunks but no commit record.
    pub orphan_artifacts: Vec<String>,
    /// Captured child stderr, lossily decoded.
    pub stderr: String,
    /// Redacted proxy descriptor (run-result frame preferred over config).
    pub proxy: Option<RedactedProxy>,
}
