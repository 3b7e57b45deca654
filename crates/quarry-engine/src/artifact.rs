use std::collections::HashMap;
use std::sync::Mutex;

use quarry_core::ArtifactStats;
use quarry_wire::{ArtifactChunk, MAX_ARTIFACT_SIZE, MAX_CHUNK_SIZE};

/// Rejections from the artifact accumulator. All of them are stream-integrity
/// violations as far as the run is concerned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArtifactError {
    /// A chunk's `data` exceeds the per-chunk cap.
    #[error("artifact {artifact_id:?}: chunk too large ({size} bytes, max {max})")]
    ChunkTooLarge {
        /// The artifact being assembled.
        artifact_id: String,
        /// Offending chunk size.
        size: usize,
        /// Per-chunk cap.
        max: usize,
    },
    /// A chunk arrived out of sequence.
    #[error("artifact {artifact_id:?}: expected chunk seq {expected}, got {got}")]
    OutOfOrder {
        /// The artifact being assembled.
        artifact_id: String,
        /// Next expected chunk sequence number.
        expected: u64,
        /// Sequence number actually received.
        got: u64,
    },
    /// A chunk arrived after `is_last`.
    #[error("artifact {artifact_id:?} is already complete")]
    AlreadyComplete {
        /// The artifact being assembled.
        artifact_id: String,
    },
    /// The accumulator was permanently rejected earlier.
    #[error("artifact {artifact_id:?} is in error state")]
    Rejected {
        /// The artifact being assembled.
        artifact_id: String,
    },
    /// The reassembled artifact would exceed the total-size cap.
    #[error("artifact {artifact_id:?} exceeds size cap ({size} bytes, max {max})")]
    TooLarge {
        /// The artifact being assembled.
        artifact_id: String,
        /// Size the operation would have reached.
        size: u64,
        /// Total-size cap.
        max: u64,
    },
    /// The commit record's declared size disagrees with the received bytes.
    #[error("artifact {artifact_id:?}: declared {declared} bytes, received {received}")]
    SizeMismatch {
        /// The artifact being assembled.
        artifact_id: String,
        /// Size the commit record declared.
        declared: u64,
        /// Bytes actually received.
        received: u64,
    },
}

struct Accumulator {
    chunks: Vec<Vec<u8>>,
    next_seq: u64,
    total_bytes: u64,
    complete: bool,
    committed: bool,
    error_state: bool,
    pending_declared: Option<u64>,
}

impl Accumulator {
    fn new() -> Self {
        Accumulator {
            chunks: Vec::new(),
            next_seq: 1,
            total_bytes: 0,
            complete: false,
            committed: false,
            error_state: false,
            pending_declared: None,
        }
    }

    fn is_orphan(&self) -> bool {
        !self.chunks.is_empty()
            && !self.committed
            && !self.error_state
            && self.pending_declared.is_none()
    }
}

/// Thread-safe store of per-artifact accumulators for one run.
pub struct ArtifactStore {
    inner: Mutex<HashMap<String, Accumulator>>,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore {
    /// Create an empty store.
    pub fn new() -> Self {
        ArtifactStore {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Accept one chunk, enforcing ordering and size caps. On the final
    /// chunk, a pending commit record is reconciled immediately.
    pub fn add_chunk(&self, chunk: &ArtifactChunk) -> Result<(), ArtifactError> {
        if chunk.data.len() > MAX_CHUNK_SIZE {
            return Err(ArtifactError::ChunkTooLarge {
                artifact_id: chunk.artifact_id.clone(),
                size: chunk.data.len(),
                max: MAX_CHUNK_SIZE,
            });
        }

        let mut inner = lock(&self.inner);
        let acc = inner
            .entry(chunk.artifact_id.clone())
            .or_insert_with(Accumulator::new);

        if acc.error_state {
            return Err(ArtifactError::Rejected {
                artifact_id: chunk.artifact_id.clone(),
            });
        }
        if acc.complete {
            return Err(ArtifactError::AlreadyComplete {
                artifact_id: chunk.artifact_id.clone(),
            });
        }
        if chunk.seq != acc.next_seq {
            return Err(ArtifactError::OutOfOrder {
                artifact_id: chunk.artifact_id.clone(),
                expected: acc.next_seq,
                got: chunk.seq,
            });
        }
        let new_total = acc.total_bytes + chunk.data.len() as u64;
        if new_total > MAX_ARTIFACT_SIZE {
            return Err(ArtifactError::TooLarge {
                artifact_id: chunk.artifact_id.clone(),
                size: new_total,
                max: MAX_ARTIFACT_SIZE,
            });
        }

        acc.chunks.push(chunk.data.clone());
        acc.next_seq += 1;
        acc.total_bytes = new_total;

        if chunk.is_last {
            acc.complete = true;
            if let Some(declared) = acc.pending_declared.take() {
                if declared == acc.total_bytes {
                    acc.committed = true;
                } else {
                    acc.error_state = true;
                    return Err(ArtifactError::SizeMismatch {
                        artifact_id: chunk.artifact_id.clone(),
                        declared,
                        received: acc.total_bytes,
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply a commit record. Before the final chunk the declared size is
    /// parked; after it, sizes must reconcile.
    pub fn commit(&self, artifact_id: &str, declared_size: u64) -> Result<(), ArtifactError> {
        if declared_size > MAX_ARTIFACT_SIZE {
            return Err(ArtifactError::TooLarge {
                artifact_id: artifact_id.to_string(),
                size: declared_size,
                max: MAX_ARTIFACT_SIZE,
            });
        }

        let mut inner = lock(&self.inner);
        let acc = inner
            .entry(artifact_id.to_string())
            .or_insert_with(Accumulator::new);

        if acc.error_state {
            return Err(ArtifactError::Rejected {
                artifact_id: artifact_id.to_string(),
            });
        }
        if acc.complete {
            if declared_size == acc.total_bytes {
                acc.committed = true;
                Ok(())
            } else {
                acc.error_state = true;
                Err(ArtifactError::SizeMismatch {
                    artifact_id: artifact_id.to_string(),
                    declared: declared_size,
                    received: acc.total_bytes,
                })
            }
        } else {
            acc.pending_declared = Some(declared_size);
            Ok(())
        }
    }

    /// Ids of accumulators holding chunks with no commit and no pending
    /// commit, sorted for stable reporting.
    pub fn orphans(&self) -> Vec<String> {
        let inner = lock(&self.inner);
        let mut ids: Vec<String> = inner
            .iter()
            .filter(|(_, acc)| acc.is_orphan())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Counters for the run report.
    pub fn stats(&self) -> ArtifactStats {
        let inner = lock(&self.inner);
        ArtifactStats {
            artifacts: inner.len() as u64,
            committed: inner.values().filter(|acc| acc.committed).count() as u64,
            orphaned: inner.values().filter(|acc| acc.is_orphan()).count() as u64,
            bytes: inner.values().map(|acc| acc.total_bytes).sum(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(artifact_id: &str, seq: u64, is_last: bool, data: &[u8]) -> ArtifactChunk {
        ArtifactChunk {
            artifact_id: artifact_id.to_string(),
            seq,
            is_last,
            data: data.to_vec(),
        }
    }

    #[test]
    fn chunks_then_commit_reconciles() {
        let store = ArtifactStore::new();
        store.add_chunk(&chunk("a", 1, false, b"hel")).unwrap();
        store.add_chunk(&chunk("a", 2, true, b"lo")).unwrap();
        store.commit("a", 5).unwrap();

        let stats = store.stats();
        assert_eq!(stats.artifacts, 1);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.bytes, 5);
        assert!(store.orphans().is_empty());
    }

    #[test]
    fn commit_before_last_chunk_is_parked_then_reconciled() {
        let store = ArtifactStore::new();
        store.add_chunk(&chunk("a", 1, false, b"hel")).unwrap();
        store.commit("a", 5).unwrap();
        // Not yet committed, but not an orphan either: a commit is pending.
        assert_eq!(store.stats().committed, 0);
        assert!(store.orphans().is_empty());

        store.add_chunk(&chunk("a", 2, true, b"lo")).unwrap();
        assert_eq!(store.stats().committed, 1);
    }

    #[test]
    fn pending_commit_mismatch_poisons_the_accumulator() {
        let store = ArtifactStore::new();
        store.commit("a", 10).unwrap();
        let err = store.add_chunk(&chunk("a", 1, true, b"hi")).unwrap_err();
        assert_eq!(
            err,
            ArtifactError::SizeMismatch {
                artifact_id: "a".to_string(),
                declared: 10,
                received: 2,
            }
        );
        // Everything afterwards is rejected.
        assert_eq!(
            store.commit("a", 2),
            Err(ArtifactError::Rejected {
                artifact_id: "a".to_string()
            })
        );
        assert!(store.orphans().is_empty());
    }

    #[test]
    fn late_commit_mismatch_poisons_the_accumulator() {
        let store = ArtifactStore::new();
        store.add_chunk(&chunk("a", 1, true, b"hi")).unwrap();
        assert!(matches!(
            store.commit("a", 3),
            Err(ArtifactError::SizeMismatch { .. })
        ));
        assert!(matches!(
            store.add_chunk(&chunk("a", 2, false, b"x")),
            Err(ArtifactError::Rejected { .. })
        ));
    }

    #[test]
    fn out_of_order_chunks_are_rejected() {
        let store = ArtifactStore::new();
        store.add_chunk(&chunk("a", 1, false, b"x")).unwrap();
        assert_eq!(
            store.add_chunk(&chunk("a", 3, false, b"y")),
            Err(ArtifactError::OutOfOrder {
                artifact_id: "a".to_string(),
                expected: 2,
                got: 3,
            })
        );
        // The rejection is not permanent; the right seq still lands.
        store.add_chunk(&chunk("a", 2, true, b"y")).unwrap();
    }

    #[test]
    fn chunks_after_last_are_rejected() {
        let store = ArtifactStore::new();
        store.add_chunk(&chunk("a", 1, true, b"x")).unwrap();
        assert_eq!(
            store.add_chunk(&chunk("a", 2, false, b"y")),
            Err(ArtifactError::AlreadyComplete {
                artifact_id: "a".to_string()
            })
        );
    }

    #[test]
    fn oversize_chunk_is_rejected() {
        let store = ArtifactStore::new();
        let big = vec![0u8; MAX_CHUNK_SIZE + 1];
        assert!(matches!(
            store.add_chunk(&chunk("a", 1, false, &big)),
            Err(ArtifactError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn oversize_commit_is_rejected() {
        let store = ArtifactStore::new();
        assert!(matches!(
            store.commit("a", MAX_ARTIFACT_SIZE + 1),
            Err(ArtifactError::TooLarge { .. })
        ));
    }

    #[test]
    fn uncommitted_chunks_are_orphans() {
        let store = ArtifactStore::new();
        store.add_chunk(&chunk("a", 1, false, b"x")).unwrap();
        store.add_chunk(&chunk("b", 1, true, b"y")).unwrap();
        store.commit("b", 1).unwrap();
        assert_eq!(store.orphans(), vec!["a".to_string()]);
        assert_eq!(store.stats().orphaned, 1);
    }
}
