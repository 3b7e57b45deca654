use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use quarry_core::JobInput;

/// Executor exit codes; the supervisor classifies outcomes from these.
pub mod exit_code {
    /// Completed normally; `run_complete` should have been emitted.
    pub const COMPLETED: i32 = 0;
    /// Script failed; `run_error` should have been emitted.
    pub const SCRIPT_ERROR: i32 = 1;
    /// Executor crashed without a terminal event.
    pub const CRASH: i32 = 2;
    /// Bad stdin descriptor or unknown script.
    pub const INVALID_INPUT: i32 = 3;
}

/// Read the job descriptor: the first newline-terminated JSON object on
/// stdin. The reader is left positioned at the ack frame stream and should
/// be handed to [`crate::AckReader::spawn`].
pub async fn read_job_input<R>(reader: &mut R) -> anyhow::Result<JobInput>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .context("read job descriptor line")?;
    if n == 0 {
        anyhow::bail!("stdin closed before the job descriptor arrived");
    }
    let input: JobInput =
        serde_json::from_str(line.trim_end()).context("parse job descriptor")?;
    Ok(input)
}
