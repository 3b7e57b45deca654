use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use quarry_core::{FileWriter, RunResult, RunSpec, StoragePartition};
use quarry_wire::EventEnvelope;

use crate::ingest::EnqueueObserver;
use crate::orchestrate::Orchestrator;

/// Produces the partition-bound sidecar writer for a derived run, if any.
pub type WriterFactory = Arc<dyn Fn(&RunSpec) -> Option<Arc<dyn FileWriter>> + Send + Sync>;

/// Bounds on a fan-out session.
#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    /// Maximum depth of derived runs; the root is depth 0.
    pub max_depth: u32,
    /// Total started runs across the tree, the root included.
    pub max_runs: usize,
    /// Worker pool size.
    pub parallel: usize,
}

/// One unit of derived work, consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Script path to run.
    pub target: String,
    /// Script parameters.
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Depth in the fan-out tree.
    pub depth: u32,
    /// Hash identifying this unit of work.
    pub dedup_key: String,
    /// Run id reserved for this item.
    pub assigned_run_id: String,
    /// Partition hint; not part of the dedup key.
    pub source: Option<String>,
    /// Partition hint; not part of the dedup key.
    pub category: Option<String>,
}

/// Session counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FanoutStats {
    /// Runs started, root included.
    pub runs_started: u64,
    /// Runs that returned a result.
    pub runs_finished: u64,
    /// Runs classified as success.
    pub succeeded: u64,
    /// Runs classified as anything else.
    pub failed: u64,
    /// Enqueue events observed.
    pub enqueue_received: u64,
    /// Enqueues dropped as duplicates.
    pub enqueue_deduped: u64,
    /// Enqueues dropped for depth, slots, or missing target.
    pub enqueue_skipped: u64,
}

/// Runs one work item to completion. The fan-out operator hands each
/// invocation a fresh observer bound to the item's depth; recursion happens
/// because the child's ingestion invokes that observer.
#[async_trait]
pub trait RunFactory: Send + Sync {
    /// Execute the item and return its result.
    async fn run(&self, item: WorkItem, observer: EnqueueObserver) -> RunResult;
}

/// What a fan-out session produced.
#[derive(Debug)]
pub struct FanoutReport {
    /// The root run's id.
    pub root_run_id: String,
    /// Completed results keyed by run id, root included.
    pub results: BTreeMap<String, RunResult>,
    /// Final counters.
    pub stats: FanoutStats,
}

impl FanoutReport {
    /// The root run's result, absent only if the session was canceled
    /// before the root completed.
    pub fn root(&self) -> Option<&RunResult> {
        self.results.get(&self.root_run_id)
    }
}

struct Shared {
    max_depth: u32,
    max_runs: u64,
    root_run_id: String,
    queue_tx: mpsc::Sender<WorkItem>,
    seen: Mutex<HashSet<String>>,
    child_counter: AtomicU64,
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    enqueue_received: AtomicU64,
    enqueue_deduped: AtomicU64,
    enqueue_skipped: AtomicU64,
}

impl Shared {
    fn observer(self: &Arc<Self>, depth: u32) -> EnqueueObserver {
        let shared = self.clone();
        Arc::new(move |env: &EventEnvelope| shared.on_enqueue(depth, env))
    }

    fn on_enqueue(&self, depth: u32, env: &EventEnvelope) {
        self.enqueue_received.fetch_add(1, Ordering::SeqCst);

        let target = env.payload_str("target").unwrap_or("");
        if target.is_empty() {
            self.enqueue_skipped.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let child_depth = depth + 1;
        if child_depth > self.max_depth {
            self.enqueue_skipped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(script = target, child_depth, "enqueue beyond max depth; skipping");
            return;
        }

        let params = env
            .payload
            .get("params")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let key = dedup_key(target, &params);

        // Dedup insertion and slot reservation are atomic under this lock;
        // that is what keeps the max_runs bound exact across observers.
        let reserved = {
            let mut seen = lock(&self.seen);
            if seen.contains(&key) {
                self.enqueue_deduped.fetch_add(1, Ordering::SeqCst);
                false
            } else if self.runs_started.load(Ordering::SeqCst) >= self.max_runs {
                self.enqueue_skipped.fetch_add(1, Ordering::SeqCst);
                false
            } else {
                seen.insert(key.clone());
                self.runs_started.fetch_add(1, Ordering::SeqCst);
                true
            }
        };
        if !reserved {
            return;
        }

        let child_no = self.child_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let item = WorkItem {
            target: target.to_string(),
            params,
            depth: child_depth,
            dedup_key: key,
            assigned_run_id: format!("{}.w{child_no}", self.root_run_id),
            source: env.payload_str("source").map(str::to_string),
            category: env.payload_str("category").map(str::to_string),
        };
        if self.queue_tx.try_send(item).is_err() {
            // Capacity equals max_runs, so this only fires during shutdown.
            self.enqueue_skipped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(script = target, "fanout queue refused derived work");
        }
    }

    fn stats(&self) -> FanoutStats {
        FanoutStats {
            runs_started: self.runs_started.load(Ordering::SeqCst),
            runs_finished: self.runs_finished.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            enqueue_received: self.enqueue_received.load(Ordering::SeqCst),
            enqueue_deduped: self.enqueue_deduped.load(Ordering::SeqCst),
            enqueue_skipped: self.enqueue_skipped.load(Ordering::SeqCst),
        }
    }
}

/// `sha256(target || 0x00 || canonical_json(params))`, hex-encoded.
///
/// `serde_json`'s map type keeps keys sorted at every nesting level, which
/// is the canonicalization the key relies on. Partition hints are excluded:
/// the same logical work must not re-execute because a label differs.
pub(crate) fn dedup_key(
    target: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::Value::Object(params.clone()).to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn spawn_item(
    join: &mut JoinSet<Option<(String, RunResult)>>,
    shared: &Arc<Shared>,
    factory: &Arc<dyn RunFactory>,
    sem: &Arc<Semaphore>,
    item: WorkItem,
) {
    let observer = shared.observer(item.depth);
    let factory = factory.clone();
    let sem = sem.clone();
    join.spawn(async move {
        let Ok(_permit) = sem.acquire_owned().await else {
            return None;
        };
        let run_id = item.assigned_run_id.clone();
        let result = factory.run(item, observer).await;
        Some((run_id, result))
    });
}

fn record(
    joined: Option<Result<Option<(String, RunResult)>, tokio::task::JoinError>>,
    shared: &Arc<Shared>,
    results: &mut BTreeMap<String, RunResult>,
) {
    match joined {
        Some(Ok(Some((run_id, result)))) => {
            shared.runs_finished.fetch_add(1, Ordering::SeqCst);
            if result.outcome.is_success() {
                shared.succeeded.fetch_add(1, Ordering::SeqCst);
            } else {
                shared.failed.fetch_add(1, Ordering::SeqCst);
            }
            results.insert(run_id, result);
        }
        Some(Ok(None)) => {}
        Some(Err(err)) => {
            shared.runs_finished.fetch_add(1, Ordering::SeqCst);
            shared.failed.fetch_add(1, Ordering::SeqCst);
            tracing::error!(error = %err, "fanout worker task failed");
        }
        None => {}
    }
}

/// Execute the root run plus recursively enqueued derived runs until the
/// tree quiesces: root completed, queue empty, all workers finished.
pub async fn run_fanout(
    cfg: FanoutConfig,
    root: RunSpec,
    factory: Arc<dyn RunFactory>,
    cancel: CancellationToken,
) -> FanoutReport {
    let max_runs = cfg.max_runs.max(1);
    let parallel = cfg.parallel.max(1);
    let (queue_tx, mut queue_rx) = mpsc::channel::<WorkItem>(max_runs);

    let shared = Arc::new(Shared {
        max_depth: cfg.max_depth,
        max_runs: max_runs as u64,
        root_run_id: root.run_id.clone(),
        queue_tx,
        seen: Mutex::new(HashSet::new()),
        child_counter: AtomicU64::new(0),
        runs_started: AtomicU64::new(0),
        runs_finished: AtomicU64::new(0),
        succeeded: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        enqueue_received: AtomicU64::new(0),
        enqueue_deduped: AtomicU64::new(0),
        enqueue_skipped: AtomicU64::new(0),
    });

    // The root occupies the first slot and seeds the dedup set so children
    // re-enqueueing the same work are deduplicated against it.
    let root_key = dedup_key(&root.target, &root.params);
    lock(&shared.seen).insert(root_key.clone());
    shared.runs_started.fetch_add(1, Ordering::SeqCst);

    let root_item = WorkItem {
        target: root.target.clone(),
        params: root.params.clone(),
        depth: 0,
        dedup_key: root_key,
        assigned_run_id: root.run_id.clone(),
        source: root.storage.as_ref().map(|s| s.source.clone()),
        category: root.storage.as_ref().map(|s| s.category.clone()),
    };

    let sem = Arc::new(Semaphore::new(parallel));
    let mut join: JoinSet<Option<(String, RunResult)>> = JoinSet::new();
    let mut results = BTreeMap::new();

    spawn_item(&mut join, &shared, &factory, &sem, root_item);

    loop {
        while let Ok(item) = queue_rx.try_recv() {
            spawn_item(&mut join, &shared, &factory, &sem, item);
        }
        if join.is_empty() {
            // No workers in flight means no observer can enqueue anymore;
            // an empty queue here is quiescence.
            match queue_rx.try_recv() {
                Ok(item) => {
                    spawn_item(&mut join, &shared, &factory, &sem, item);
                    continue;
                }
                Err(_) => break,
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            joined = join.join_next() => record(joined, &shared, &mut results),
            item = queue_rx.recv() => {
                if let Some(item) = item {
                    spawn_item(&mut join, &shared, &factory, &sem, item);
                }
            }
        }
    }

    // Canceled or quiesced: stop dispatching, wait for in-flight workers.
    while let Some(joined) = join.join_next().await {
        record(Some(joined), &shared, &mut results);
    }

    FanoutReport {
        root_run_id: root.run_id,
        results,
        stats: shared.stats(),
    }
}

/// Bridges the fan-out operator to the orchestrator: derives a run spec for
/// each work item and executes it as a child run.
pub struct FanoutRunner {
    orchestrator: Orchestrator,
    base: RunSpec,
    writers: WriterFactory,
    cancel: CancellationToken,
}

impl FanoutRunner {
    /// Bind an orchestrator to a root spec; derived runs inherit its proxy,
    /// browser endpoint, and storage partition, and get their own writer
    /// from `writers`.
    pub fn new(
        orchestrator: Orchestrator,
        base: RunSpec,
        writers: WriterFactory,
        cancel: CancellationToken,
    ) -> Self {
        FanoutRunner {
            orchestrator,
            base,
            writers,
            cancel,
        }
    }
}

#[async_trait]
impl RunFactory for FanoutRunner {
    async fn run(&self, item: WorkItem, observer: EnqueueObserver) -> RunResult {
        let spec = if item.assigned_run_id == self.base.run_id {
            self.base.clone()
        } else {
            derive_spec(&self.base, &item)
        };
        let files = (self.writers)(&spec);
        self.orchestrator
            .run(&spec, files, Some(observer), &self.cancel)
            .await
    }
}

fn derive_spec(base: &RunSpec, item: &WorkItem) -> RunSpec {
    RunSpec {
        run_id: item.assigned_run_id.clone(),
        attempt: 1,
        job_id: None,
        parent_run_id: None,
        target: item.target.clone(),
        params: item.params.clone(),
        proxy: base.proxy.clone(),
        browser_ws_endpoint: base.browser_ws_endpoint.clone(),
        storage: base.storage.as_ref().map(|s| StoragePartition {
            dataset: s.dataset.clone(),
            source: item.source.clone().unwrap_or_else(|| s.source.clone()),
            category: item.category.clone().unwrap_or_else(|| s.category.clone()),
            day: s.day.clone(),
            run_id: item.assigned_run_id.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use quarry_core::{ArtifactStats, RunOutcome, SinkStats};
    use quarry_wire::{EventType, CONTRACT_VERSION};

    fn success_result(run_id: &str) -> RunResult {
        RunResult {
            run_id: run_id.to_string(),
            job_id: None,
            attempt: 1,
            outcome: RunOutcome::Success,
            message: "run completed".to_string(),
            error_type: None,
            stack: None,
            exit_code: Some(0),
            duration_ms: 1,
            sink: SinkStats::default(),
            artifacts: ArtifactStats::default(),
            orphan_artifacts: Vec::new(),
            stderr: String::new(),
            proxy: None,
        }
    }

    fn enqueue_envelope(target: &str, params: serde_json::Value) -> EventEnvelope {
        let mut payload = serde_json::Map::new();
        payload.insert("target".to_string(), serde_json::json!(target));
        payload.insert("params".to_string(), params);
        EventEnvelope {
            contract_version: CONTRACT_VERSION.to_string(),
            event_id: "ev-1".to_string(),
            run_id: "run-1".to_string(),
            attempt: 1,
            seq: 1,
            kind: EventType::Enqueue,
            ts: "2026-01-01T00:00:00Z".to_string(),
            job_id: None,
            parent_run_id: None,
            payload,
        }
    }

    /// Emits the planned enqueues for each target through the observer, then
    /// reports success. Tracks executed depths and peak concurrency.
    struct ScriptedFactory {
        enqueues: HashMap<String, Vec<(String, serde_json::Value)>>,
        executed: StdMutex<Vec<(String, u32)>>,
        in_flight: AtomicU64,
        peak_in_flight: AtomicU64,
        delay: Duration,
    }

    impl ScriptedFactory {
        fn new(enqueues: HashMap<String, Vec<(String, serde_json::Value)>>) -> Self {
            ScriptedFactory {
                enqueues,
                executed: StdMutex::new(Vec::new()),
                in_flight: AtomicU64::new(0),
                peak_in_flight: AtomicU64::new(0),
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl RunFactory for ScriptedFactory {
        async fn run(&self, item: WorkItem, observer: EnqueueObserver) -> RunResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            self.executed
                .lock()
                .unwrap()
                .push((item.target.clone(), item.depth));

            if let Some(planned) = self.enqueues.get(&item.target) {
                for (target, params) in planned {
                    observer(&enqueue_envelope(target, params.clone()));
                }
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            success_result(&item.assigned_run_id)
        }
    }

    fn root_spec(target: &str) -> RunSpec {
        RunSpec {
            run_id: "root".to_string(),
            attempt: 1,
            job_id: None,
            parent_run_id: None,
            target: target.to_string(),
            params: serde_json::Map::new(),
            proxy: None,
            browser_ws_endpoint: None,
            storage: None,
        }
    }

    fn cfg(max_depth: u32, max_runs: usize, parallel: usize) -> FanoutConfig {
        FanoutConfig {
            max_depth,
            max_runs,
            parallel,
        }
    }

    #[tokio::test]
    async fn dedup_and_depth_cap() {
        // The root enqueues five identical items; the surviving child
        // enqueues one more that exceeds the depth cap.
        let mut enqueues = HashMap::new();
        enqueues.insert(
            "root.js".to_string(),
            vec![
                ("detail.js".to_string(), serde_json::json!({"page": 1})),
                ("detail.js".to_string(), serde_json::json!({"page": 1})),
                ("detail.js".to_string(), serde_json::json!({"page": 1})),
                ("detail.js".to_string(), serde_json::json!({"page": 1})),
                ("detail.js".to_string(), serde_json::json!({"page": 1})),
            ],
        );
        enqueues.insert(
            "detail.js".to_string(),
            vec![("deeper.js".to_string(), serde_json::json!({}))],
        );
        let factory = Arc::new(ScriptedFactory::new(enqueues));
        let report = run_fanout(
            cfg(1, 100, 4),
            root_spec("root.js"),
            factory.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.stats.enqueue_received, 6);
        assert_eq!(report.stats.enqueue_deduped, 4);
        assert_eq!(report.stats.enqueue_skipped, 1);
        assert_eq!(report.stats.runs_started, 2); // root + one derived
        assert_eq!(report.results.len(), 2);
        assert!(report.root().is_some());
    }

    #[tokio::test]
    async fn total_runs_are_bounded() {
        let mut enqueues = HashMap::new();
        enqueues.insert(
            "root.js".to_string(),
            (0..10)
                .map(|i| (format!("page-{i}.js"), serde_json::json!({})))
                .collect(),
        );
        let factory = Arc::new(ScriptedFactory::new(enqueues));
        let report = run_fanout(
            cfg(3, 3, 4),
            root_spec("root.js"),
            factory.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.stats.runs_started, 3);
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.stats.enqueue_skipped, 8); // 10 offered, 2 slots left
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_parallel() {
        let mut enqueues = HashMap::new();
        enqueues.insert(
            "root.js".to_string(),
            (0..6)
                .map(|i| (format!("page-{i}.js"), serde_json::json!({})))
                .collect(),
        );
        let mut factory = ScriptedFactory::new(enqueues);
        factory.delay = Duration::from_millis(20);
        let factory = Arc::new(factory);
        let report = run_fanout(
            cfg(2, 100, 2),
            root_spec("root.js"),
            factory.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(report.results.len(), 7);
        assert!(factory.peak_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn executed_depth_never_exceeds_max_depth() {
        let mut enqueues = HashMap::new();
        enqueues.insert(
            "root.js".to_string(),
            vec![("a.js".to_string(), serde_json::json!({}))],
        );
        enqueues.insert(
            "a.js".to_string(),
            vec![("b.js".to_string(), serde_json::json!({}))],
        );
        enqueues.insert(
            "b.js".to_string(),
            vec![("c.js".to_string(), serde_json::json!({}))],
        );
        let factory = Arc::new(ScriptedFactory::new(enqueues));
        let report = run_fanout(
            cfg(2, 100, 4),
            root_spec("root.js"),
            factory.clone(),
            CancellationToken::new(),
        )
        .await;

        let executed = factory.executed.lock().unwrap();
        assert!(executed.iter().all(|(_, depth)| *depth <= 2));
        assert_eq!(executed.len(), 3); // root, a, b; c is beyond the cap
        assert_eq!(report.stats.enqueue_skipped, 1);
    }

    #[tokio::test]
    async fn partition_hints_do_not_defeat_dedup() {
        let mut first = enqueue_envelope("detail.js", serde_json::json!({"page": 1}));
        first
            .payload
            .insert("source".to_string(), serde_json::json!("acme"));
        let mut second = enqueue_envelope("detail.js", serde_json::json!({"page": 1}));
        second
            .payload
            .insert("source".to_string(), serde_json::json!("globex"));

        let (queue_tx, mut queue_rx) = mpsc::channel(8);
        let shared = Arc::new(Shared {
            max_depth: 2,
            max_runs: 8,
            root_run_id: "root".to_string(),
            queue_tx,
            seen: Mutex::new(HashSet::new()),
            child_counter: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            enqueue_received: AtomicU64::new(0),
            enqueue_deduped: AtomicU64::new(0),
            enqueue_skipped: AtomicU64::new(0),
        });
        let observer = shared.observer(0);
        observer(&first);
        observer(&second);

        assert_eq!(shared.enqueue_deduped.load(Ordering::SeqCst), 1);
        let item = queue_rx.try_recv().unwrap();
        assert_eq!(item.source.as_deref(), Some("acme"));
        assert!(queue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_target_is_skipped() {
        let (queue_tx, _queue_rx) = mpsc::channel(8);
        let shared = Arc::new(Shared {
            max_depth: 2,
            max_runs: 8,
            root_run_id: "root".to_string(),
            queue_tx,
            seen: Mutex::new(HashSet::new()),
            child_counter: AtomicU64::new(0),
            runs_started: AtomicU64::new(0),
            runs_finished: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            enqueue_received: AtomicU64::new(0),
            enqueue_deduped: AtomicU64::new(0),
            enqueue_skipped: AtomicU64::new(0),
        });
        let observer = shared.observer(0);
        observer(&enqueue_envelope("", serde_json::json!({})));
        assert_eq!(shared.enqueue_skipped.load(Ordering::SeqCst), 1);
        assert_eq!(shared.runs_started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dedup_key_ignores_map_ordering_and_tracks_content() {
        let a: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"b": 2, "a": {"y": 1, "x": 0}}"#).unwrap();
        let b: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"a": {"x": 0, "y": 1}, "b": 2}"#).unwrap();
        assert_eq!(dedup_key("t.js", &a), dedup_key("t.js", &b));

        let c: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"a": {"x": 0, "y": 1}, "b": 3}"#).unwrap();
        assert_ne!(dedup_key("t.js", &a), dedup_key("t.js", &c));
        assert_ne!(dedup_key("t.js", &a), dedup_key("u.js", &a));
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_but_waits_for_in_flight() {
        let mut enqueues = HashMap::new();
        enqueues.insert(
            "root.js".to_string(),
            vec![("a.js".to_string(), serde_json::json!({}))],
        );
        let mut factory = ScriptedFactory::new(enqueues);
        factory.delay = Duration::from_millis(50);
        let factory = Arc::new(factory);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run_fanout(
            cfg(2, 100, 2),
            root_spec("root.js"),
            factory.clone(),
            cancel,
        )
        .await;

        // The root was already spawned and is awaited to completion; its
        // derived item is never dispatched.
        assert!(report.root().is_some());
        assert_eq!(report.results.len(), 1);
        assert_eq!(factory.executed.lock().unwrap().len(), 1);
    }

    #[test]
    fn derived_specs_inherit_the_base_and_override_partition_hints() {
        let mut base = root_spec("root.js");
        base.storage = Some(StoragePartition {
            dataset: "listings".to_string(),
            source: "acme".to_string(),
            category: "all".to_string(),
            day: "2026-07-31".to_string(),
            run_id: "root".to_string(),
        });
        let item = WorkItem {
            target: "detail.js".to_string(),
            params: serde_json::Map::new(),
            depth: 1,
            dedup_key: "k".to_string(),
            assigned_run_id: "root.w1".to_string(),
            source: None,
            category: Some("apartments".to_string()),
        };
        let spec = derive_spec(&base, &item);
        assert_eq!(spec.run_id, "root.w1");
        assert_eq!(spec.attempt, 1);
        assert!(spec.validate().is_ok());
        let storage = spec.storage.unwrap();
        assert_eq!(storage.source, "acme");
        assert_eq!(storage.category, "apartments");
        assert_eq!(storage.run_id, "root.w1");
    }
}
