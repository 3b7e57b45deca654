#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Wire protocol between the supervisor and executor children: length-prefixed
//! MessagePack frames, event envelopes, control frames, and chunk planning.

/// Event envelope and event type enumeration.
pub mod envelope;
/// Frame types and tag-discriminated decoding.
pub mod frame;
/// Length-prefixed codec and artifact chunk planning.
pub mod codec;

pub use codec::{chunk_plan, encode, read_frame, write_frame, ChunkSpan};
pub use envelope::{EventEnvelope, EventType};
pub use frame::{
    ArtifactChunk, FileWrite, FileWriteAck, Frame, ProxyUsed, RunResultFrame, ScriptOutcome,
    ScriptStatus,
};

/// Contract version stamped on every envelope; supervisor and child must agree.
pub const CONTRACT_VERSION: &str = "1";

/// Hard cap on a whole frame (length prefix included).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Cap on the MessagePack payload of a single frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - 4;

/// Cap on the `data` field of a single artifact chunk or sidecar file write.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Cap on the reassembled size of a single artifact.
pub const MAX_ARTIFACT_SIZE: u64 = 1024 * 1024 * 1024;

/// Errors produced by framing, encoding, and decoding.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("frame payload too large ({size} bytes, max {max})")]
    FrameTooLarge {
        /// Attempted payload size in bytes.
        size: usize,
        /// Maximum allowed payload size in bytes.
        max: usize,
    },

    /// The stream ended inside a frame.
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated {
        /// Bytes the frame announced.
        expected: usize,
        /// Bytes actually read before EOF.
        got: usize,
    },

    /// The payload's `type` tag names no known frame.
    #[error("unknown frame type tag {tag:?}")]
    UnknownTag {
        /// The offending tag.
        tag: String,
    },

    /// The payload is not valid MessagePack for its tag.
    #[error("malformed frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The frame could not be serialized.
    #[error("encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A control frame body could not be tagged and serialized.
    #[error("encode control frame: {0}")]
    EncodeControl(String),

    /// Reading from the underlying stream failed.
    #[error("frame read: {0}")]
    Io(#[from] std::io::Error),
}
