#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared types for the `quarry` runtime: run identities and results, the
//! job-descriptor stdin contract, storage partitions, proxy redaction, and
//! the sink / file-writer abstractions persistence backends implement.

/// Job descriptor line written to an executor child's stdin.
pub mod input;
/// Storage partition addressing for persisted files.
pub mod partition;
/// Proxy configuration and redaction.
pub mod proxy;
/// Run specification, outcome classification, and results.
pub mod run;
/// Event sink and file writer abstractions.
pub mod sink;

pub use input::{JobDescriptor, JobInput};
pub use partition::StoragePartition;
pub use proxy::{ProxyConfig, RedactedProxy};
pub use run::{ArtifactStats, MetadataError, RunOutcome, RunResult, RunSpec};
pub use sink::{EventSink, FileWriter, SinkError, SinkStats};
