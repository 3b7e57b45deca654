use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use quarry_wire::{read_frame, Frame};

/// Why a file-write wait did not succeed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AckError {
    /// The supervisor answered `ok = false`.
    #[error("file write rejected: {0}")]
    Rejected(String),
    /// The reader was stopped while the wait was pending.
    #[error("ack reader stopped")]
    Stopped,
    /// Stdin closed after the supervisor had already proven it speaks acks.
    #[error("stdin closed before ack arrived")]
    StdinClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    Stopped,
    /// EOF after at least one ack: pending and future waits fail.
    ClosedAfterAcks,
    /// EOF without a single ack: the supervisor is of a version that does
    /// not speak acks, so every wait resolves immediately. A child must
    /// never hang on an ack-less supervisor.
    FireAndForget,
}

struct AckState {
    pending: HashMap<u64, oneshot::Sender<Result<(), AckError>>>,
    has_ever_acked: bool,
    mode: Mode,
}

/// A single-use wait on one `write_id`'s acknowledgement.
pub struct AckWaiter {
    rx: oneshot::Receiver<Result<(), AckError>>,
}

impl AckWaiter {
    /// Suspend until the ack arrives or the reader resolves the wait.
    pub async fn wait(self) -> Result<(), AckError> {
        self.rx.await.unwrap_or(Err(AckError::Stopped))
    }
}

/// Registration handle shared with the emitter.
#[derive(Clone)]
pub struct AckHandle {
    state: Arc<Mutex<AckState>>,
}

impl AckHandle {
    /// Register a waiter for `write_id`. Must happen before the matching
    /// `file_write` frame is sent, or the ack can race the registration.
    pub fn register(&self, write_id: u64) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        let mut st = lock(&self.state);
        match st.mode {
            Mode::Running => {
                st.pending.insert(write_id, tx);
            }
            Mode::FireAndForget => {
                let _ = tx.send(Ok(()));
            }
            Mode::Stopped => {
                let _ = tx.send(Err(AckError::Stopped));
            }
            Mode::ClosedAfterAcks => {
                let _ = tx.send(Err(AckError::StdinClosed));
            }
        }
        AckWaiter { rx }
    }

    /// Deregister a waiter whose `file_write` frame never made it out.
    pub fn discard(&self, write_id: u64) {
        lock(&self.state).pending.remove(&write_id);
    }
}

/// Consumes framed messages from the child's stdin, dispatching
/// `file_write_ack` frames to registered waiters. Unknown frame types are
/// silently discarded.
pub struct AckReader {
    state: Arc<Mutex<AckState>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl AckReader {
    /// Start reading acks from `reader` (the child's stdin, positioned past
    /// the job descriptor line).
    pub fn spawn<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let state = Arc::new(Mutex::new(AckState {
            pending: HashMap::new(),
            has_ever_acked: false,
            mode: Mode::Running,
        }));
        let task = tokio::spawn(read_loop(reader, state.clone()));
        AckReader {
            state,
            task: Some(task),
        }
    }

    /// Handle for registering waiters.
    pub fn handle(&self) -> AckHandle {
        AckHandle {
            state: self.state.clone(),
        }
    }

    /// Stop the reader and fail all pending waits. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut st = lock(&self.state);
        if st.mode == Mode::Running {
            st.mode = Mode::Stopped;
            for (_, tx) in st.pending.drain() {
                let _ = tx.send(Err(AckError::Stopped));
            }
        }
    }
}

impl Drop for AckReader {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop<R>(mut reader: R, state: Arc<Mutex<AckState>>)
where
    R: AsyncRead + Send + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                if let Ok(Frame::FileWriteAck(ack)) = Frame::from_payload(&payload) {
                    let mut st = lock(&state);
                    st.has_ever_acked = true;
                    if let Some(tx) = st.pending.remove(&ack.write_id) {
                        let res = if ack.ok {
                            Ok(())
                        } else {
                            Err(AckError::Rejected(
                                ack.error.unwrap_or_else(|| "write failed".to_string()),
                            ))
                        };
                        let _ = tx.send(res);
                    }
                }
            }
            Ok(None) | Err(_) => {
                on_eof(&state);
                return;
            }
        }
    }
}

fn on_eof(state: &Arc<Mutex<AckState>>) {
    let mut st = lock(state);
    if st.mode != Mode::Running {
        return;
    }
    if st.has_ever_acked {
        st.mode = Mode::ClosedAfterAcks;
        for (_, tx) in st.pending.drain() {
            let _ = tx.send(Err(AckError::StdinClosed));
        }
    } else {
        st.mode = Mode::FireAndForget;
        for (_, tx) in st.pending.drain() {
            let _ = tx.send(Ok(()));
        }
    }
}

fn lock(state: &Mutex<AckState>) -> MutexGuard<'_, AckState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
