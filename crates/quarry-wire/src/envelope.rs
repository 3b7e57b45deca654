use serde::{Deserialize, Serialize};

/// Closed enumeration of event envelope types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A scraped data item.
    Item,
    /// A diagnostic log line from the script.
    Log,
    /// A resumable progress marker.
    Checkpoint,
    /// Commit record for a binary artifact (chunks travel separately).
    Artifact,
    /// A request to schedule derived work.
    Enqueue,
    /// Terminal: the script finished normally.
    RunComplete,
    /// Terminal: the script failed.
    RunError,
}

impl EventType {
    /// Whether this event ends the run's logical stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::RunComplete | EventType::RunError)
    }

    /// The wire tag for this event type.
    pub fn as_tag(self) -> &'static str {
        match self {
            EventType::Item => "item",
            EventType::Log => "log",
            EventType::Checkpoint => "checkpoint",
            EventType::Artifact => "artifact",
            EventType::Enqueue => "enqueue",
            EventType::RunComplete => "run_complete",
            EventType::RunError => "run_error",
        }
    }

    pub(crate) fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "item" => EventType::Item,
            "log" => EventType::Log,
            "checkpoint" => EventType::Checkpoint,
            "artifact" => EventType::Artifact,
            "enqueue" => EventType::Enqueue,
            "run_complete" => EventType::RunComplete,
            "run_error" => EventType::RunError,
            _ => return None,
        })
    }
}

/// One event emitted by an executor script.
///
/// `seq` is strictly monotonic starting at 1 within a run; control frames do
/// not consume sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Wire contract version; compared equal against [`crate::CONTRACT_VERSION`].
    pub contract_version: String,
    /// Identifier unique within the run.
    pub event_id: String,
    /// The run this event belongs to.
    pub run_id: String,
    /// Retry index of the run, 1 for the original attempt.
    pub attempt: u32,
    /// Position in the run's event stream, starting at 1.
    pub seq: i64,
    /// Event type discriminator.
    #[serde(rename = "type")]
    pub kind: EventType,
    /// RFC 3339 timestamp stamped by the emitter.
    pub ts: String,
    /// Logical job grouping retries of the same work, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Run id of the prior attempt, present iff `attempt > 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Whether this envelope is `run_complete` or `run_error`.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// A string field from the payload, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}
