#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Lode: filesystem persistence backends for `quarry`. A JSONL event sink
//! and a partition-addressed sidecar file writer.

/// Partition-addressed sidecar file writer.
pub mod files;
/// JSONL event sink.
pub mod sink;

pub use files::PartitionWriter;
pub use sink::JsonlSink;
