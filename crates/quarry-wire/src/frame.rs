use serde::{Deserialize, Serialize};

use crate::envelope::{EventEnvelope, EventType};
use crate::WireError;

/// One piece of a binary artifact, ≤ [`crate::MAX_CHUNK_SIZE`] bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactChunk {
    /// Artifact this chunk belongs to.
    pub artifact_id: String,
    /// Chunk position within the artifact, starting at 1.
    pub seq: u64,
    /// Whether this is the final chunk.
    pub is_last: bool,
    /// Raw chunk bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Final status reported by the script itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    /// The script ran to completion.
    Completed,
    /// The script failed with a handled error.
    Error,
    /// The script aborted without reaching a handled error path.
    Crash,
}

/// Outcome block of a [`RunResultFrame`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptOutcome {
    /// Self-reported status; the child's exit code remains authoritative.
    pub status: ScriptStatus,
    /// Human-readable context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error class name, for `error` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Stack trace, for `error` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Proxy descriptor as surfaced on the wire. Never carries credentials beyond
/// the username; the password stays inside the child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyUsed {
    /// Proxy server URL.
    pub server: String,
    /// Proxy username, if authentication was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Control frame summarizing the run from the child's perspective.
///
/// Does not advance the envelope sequence; the first one wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResultFrame {
    /// Self-reported outcome.
    pub outcome: ScriptOutcome,
    /// Proxy the script actually used, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_used: Option<ProxyUsed>,
}

/// Control frame: the child asks the supervisor to persist a sidecar file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileWrite {
    /// Correlation id echoed back in the ack, > 0.
    pub write_id: u64,
    /// Bare filename; the supervisor rejects path separators and `..`.
    pub filename: String,
    /// MIME type recorded with the file.
    pub content_type: String,
    /// File contents, ≤ [`crate::MAX_CHUNK_SIZE`] bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Control frame: the supervisor's answer to a [`FileWrite`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileWriteAck {
    /// The `write_id` being answered.
    pub write_id: u64,
    /// Whether the write was persisted.
    pub ok: bool,
    /// Failure detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Any frame crossing the supervisor ↔ child pipes.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// An event envelope (tag is the event type itself).
    Event(EventEnvelope),
    /// An artifact chunk.
    ArtifactChunk(ArtifactChunk),
    /// The run-result control frame.
    RunResult(RunResultFrame),
    /// A sidecar file write request.
    FileWrite(FileWrite),
    /// A sidecar file write acknowledgement.
    FileWriteAck(FileWriteAck),
}

const TAG_ARTIFACT_CHUNK: &str = "artifact_chunk";
const TAG_RUN_RESULT: &str = "run_result";
const TAG_FILE_WRITE: &str = "file_write";
const TAG_FILE_WRITE_ACK: &str = "file_write_ack";

#[derive(Deserialize)]
struct TagProbe {
    #[serde(rename = "type")]
    tag: String,
}

/// Serialize a control frame body and splice the `type` tag in as the first
/// map entry. The body serializes as a MessagePack map in named mode, so
/// tagging is a rewritten map header plus one leading string pair;
/// deserialization reads the body struct straight off the map and ignores
/// the tag.
fn tagged_payload<T: Serialize>(tag: &str, body: &T) -> Result<Vec<u8>, WireError> {
    let body_bytes = rmp_serde::to_vec_named(body)?;
    let Some((count, header_len)) = read_map_header(&body_bytes) else {
        return Err(WireError::EncodeControl(format!(
            "control frame body for tag {tag:?} is not a map"
        )));
    };
    let mut out = Vec::with_capacity(body_bytes.len() + tag.len() + 8);
    write_map_header(&mut out, count + 1);
    write_str(&mut out, "type");
    write_str(&mut out, tag);
    out.extend_from_slice(&body_bytes[header_len..]);
    Ok(out)
}

/// Map marker decode: fixmap, map16, or map32. Returns the entry count and
/// the header's byte length.
fn read_map_header(bytes: &[u8]) -> Option<(u32, usize)> {
    match *bytes.first()? {
        marker @ 0x80..=0x8f => Some(((marker & 0x0f) as u32, 1)),
        0xde => {
            let count = u16::from_be_bytes([*bytes.get(1)?, *bytes.get(2)?]);
            Some((count as u32, 3))
        }
        0xdf => {
            let count = u32::from_be_bytes([
                *bytes.get(1)?,
                *bytes.get(2)?,
                *bytes.get(3)?,
                *bytes.get(4)?,
            ]);
            Some((count, 5))
        }
        _ => None,
    }
}

fn write_map_header(out: &mut Vec<u8>, count: u32) {
    if count <= 0x0f {
        out.push(0x80 | count as u8);
    } else if count <= u16::MAX as u32 {
        out.push(0xde);
        out.extend_from_slice(&(count as u16).to_be_bytes());
    } else {
        out.push(0xdf);
        out.extend_from_slice(&count.to_be_bytes());
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= 31, "frame tags are short fixstr strings");
    out.push(0xa0 | s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

impl Frame {
    /// Serialize this frame's MessagePack payload (no length prefix).
    pub fn to_payload(&self) -> Result<Vec<u8>, WireError> {
        let bytes = match self {
            Frame::Event(env) => rmp_serde::to_vec_named(env)?,
            Frame::ArtifactChunk(body) => tagged_payload(TAG_ARTIFACT_CHUNK, body)?,
            Frame::RunResult(body) => tagged_payload(TAG_RUN_RESULT, body)?,
            Frame::FileWrite(body) => tagged_payload(TAG_FILE_WRITE, body)?,
            Frame::FileWriteAck(body) => tagged_payload(TAG_FILE_WRITE_ACK, body)?,
        };
        Ok(bytes)
    }

    /// Parse a MessagePack payload into a frame, routing on its `type` tag.
    pub fn from_payload(payload: &[u8]) -> Result<Frame, WireError> {
        let probe: TagProbe = rmp_serde::from_slice(payload)?;
        match probe.tag.as_str() {
            TAG_ARTIFACT_CHUNK => Ok(Frame::ArtifactChunk(rmp_serde::from_slice(payload)?)),
            TAG_RUN_RESULT => Ok(Frame::RunResult(rmp_serde::from_slice(payload)?)),
            TAG_FILE_WRITE => Ok(Frame::FileWrite(rmp_serde::from_slice(payload)?)),
            TAG_FILE_WRITE_ACK => Ok(Frame::FileWriteAck(rmp_serde::from_slice(payload)?)),
            tag => {
                if EventType::from_tag(tag).is_some() {
                    Ok(Frame::Event(rmp_serde::from_slice(payload)?))
                } else {
                    Err(WireError::UnknownTag {
                        tag: tag.to_string(),
                    })
                }
            }
        }
    }
}
