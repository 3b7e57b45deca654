use serde::{Deserialize, Serialize};

use crate::partition::StoragePartition;
use crate::proxy::ProxyConfig;
use crate::run::RunSpec;

/// The work unit inside a [`JobInput`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    /// Script path the executor resolves and runs.
    pub target: String,
    /// Script parameters.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// The single JSON line written to an executor child's stdin before any
/// ack frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInput {
    /// Caller-assigned run id.
    pub run_id: String,
    /// Retry index, 1 for the original attempt.
    pub attempt: u32,
    /// Logical job id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Prior attempt's run id, present iff `attempt > 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// The work to perform.
    pub job: JobDescriptor,
    /// Proxy settings, credentials included. This descriptor never leaves
    /// the supervisor-to-child pipe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    /// Reusable-browser websocket endpoint, if one is shared in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_ws_endpoint: Option<String>,
    /// Storage partition for sidecar files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StoragePartition>,
}

impl JobInput {
    /// Build the child descriptor from a run spec.
    pub fn from_spec(spec: &RunSpec) -> Self {
        JobInput {
            run_id: spec.run_id.clone(),
            attempt: spec.attempt,
            job_id: spec.job_id.clone(),
            parent_run_id: spec.parent_run_id.clone(),
            job: JobDescriptor {
                target: spec.target.clone(),
                params: spec.params.clone(),
            },
            proxy: spec.proxy.clone(),
            browser_ws_endpoint: spec.browser_ws_endpoint.clone(),
            storage: spec.storage.clone(),
        }
    }

    /// Serialize as the newline-terminated stdin line.
    pub fn to_line(&self) -> anyhow::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
