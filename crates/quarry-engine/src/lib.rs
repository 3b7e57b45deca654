#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Supervisor engine for `quarry`: artifact reassembly, frame ingestion,
//! executor process management, single-run orchestration, and bounded
//! recursive fan-out.

/// Per-artifact chunk reassembly and commit reconciliation.
pub mod artifact;
/// Executor child process lifecycle.
pub mod executor;
/// Bounded-concurrency recursive fan-out of derived runs.
pub mod fanout;
/// Frame ingestion from a child's output stream.
pub mod ingest;
/// Single-run orchestration and outcome classification.
pub mod orchestrate;

pub use artifact::{ArtifactError, ArtifactStore};
pub use executor::{
    ChildHandle, Executor, ExecutorConfig, ExitReport, ProcessExecutor, SharedWriter, SpawnedChild,
};
pub use fanout::{
    run_fanout, FanoutConfig, FanoutReport, FanoutRunner, FanoutStats, RunFactory, WorkItem,
    WriterFactory,
};
pub use ingest::{EnqueueObserver, IngestEngine, IngestError, IngestErrorKind, IngestReport};
pub use orchestrate::Orchestrator;
