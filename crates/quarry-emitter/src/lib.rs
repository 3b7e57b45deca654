#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Child-side library for `quarry` executors: the framed event emitter, the
//! ack reader for sidecar file writes, the stdout guard, and job input
//! parsing. Everything here runs inside the executor process; the only
//! channel back to the supervisor is the framed stdout stream.

/// Reverse-channel reader for file-write acknowledgements.
pub mod ack;
/// Framed event emitter.
pub mod emit;
/// Stdout guard protecting the framed channel from stray writes.
pub mod guard;
/// Job descriptor parsing and executor exit codes.
pub mod job;

pub use ack::{AckError, AckHandle, AckReader, AckWaiter};
pub use emit::{EmitError, Emitter};
pub use guard::{install_stdout_guard, GuardError};
pub use job::{exit_code, read_job_input};
