mod cli;
mod shutdown;

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use quarry_core::{FileWriter, ProxyConfig, RunSpec, StoragePartition};
use quarry_engine::{
    run_fanout, ExecutorConfig, FanoutConfig, FanoutRunner, Orchestrator, ProcessExecutor,
    WriterFactory,
};
use quarry_lode::{JsonlSink, PartitionWriter};

use crate::cli::Cli;
use crate::shutdown::spawn_ctrl_c_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
    let day = Utc::now().format("%Y-%m-%d").to_string();

    let storage = StoragePartition {
        dataset: cli.dataset.clone(),
        source: cli.source.clone(),
        category: cli.category.clone(),
        day,
        run_id: run_id.clone(),
    };

    let proxy = cli.proxy_server.clone().map(|server| ProxyConfig {
        server,
        username: cli.proxy_username.clone(),
        password: cli.proxy_password.clone(),
    });

    let spec = RunSpec {
        run_id: run_id.clone(),
        attempt: 1,
        job_id: None,
        parent_run_id: None,
        target: cli.target.clone(),
        params: cli.params.clone(),
        proxy,
        browser_ws_endpoint: None,
        storage: Some(storage),
    };

    let sink = Arc::new(JsonlSink::new(&cli.out));
    let executor = Arc::new(ProcessExecutor::new(ExecutorConfig {
        executor_bin: cli.executor_bin.clone(),
        module_path_override: cli.module_path.clone(),
        env: Vec::new(),
    }));
    let orchestrator = Orchestrator::new(executor, sink);

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let out_root = cli.out.clone();
    let writers: WriterFactory = Arc::new(move |spec: &RunSpec| {
        spec.storage.clone().map(|partition| {
            Arc::new(PartitionWriter::new(out_root.clone(), partition)) as Arc<dyn FileWriter>
        })
    });

    let runner = Arc::new(FanoutRunner::new(
        orchestrator,
        spec.clone(),
        writers,
        cancel.clone(),
    ));

    println!(
        "quarry {} run_id={run_id} target={} parallel={}",
        env!("CARGO_PKG_VERSION"),
        cli.target,
        cli.parallel
    );

    let report = run_fanout(
        FanoutConfig {
            max_depth: cli.max_depth,
            max_runs: cli.max_runs as usize,
            parallel: cli.parallel as usize,
        },
        spec,
        runner,
        cancel,
    )
    .await;

    for (run_id, result) in &report.results {
        println!(
            "{run_id} {:>16} exit={} {}ms events={} {}",
            result.outcome.as_str(),
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            result.duration_ms,
            result.sink.total_events,
            result.message,
        );
        if !result.orphan_artifacts.is_empty() {
            tracing::warn!(
                run_id = %run_id,
                orphans = result.orphan_artifacts.len(),
                "run left orphan artifacts"
            );
        }
    }
    println!(
        "runs={} succeeded={} failed={} enqueued={} deduped={} skipped={}",
        report.stats.runs_finished,
        report.stats.succeeded,
        report.stats.failed,
        report.stats.enqueue_received,
        report.stats.enqueue_deduped,
        report.stats.enqueue_skipped,
    );

    match report.root() {
        Some(root) if root.outcome.is_success() => Ok(()),
        Some(root) => {
            anyhow::bail!("root run {} failed: {}", root.run_id, root.message)
        }
        None => anyhow::bail!("root run did not complete"),
    }
}
