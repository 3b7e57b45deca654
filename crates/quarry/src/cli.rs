use std::path::PathBuf;

use clap::Parser;

fn parse_params(input: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let value: serde_json::Value =
        serde_json::from_str(input).map_err(|err| format!("invalid params JSON: {err}"))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(format!("params must be a JSON object, got {other}")),
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "quarry", version, about = "Quarry scraping run supervisor")]
pub struct Cli {
    /// Path to the executor binary that runs scripts.
    #[arg(long, env = "QUARRY_EXECUTOR_BIN")]
    pub executor_bin: PathBuf,

    /// Script path for the root run.
    #[arg(long, env = "QUARRY_TARGET")]
    pub target: String,

    /// Root run id. Defaults to a timestamp-derived id.
    #[arg(long, env = "QUARRY_RUN_ID")]
    pub run_id: Option<String>,

    /// Script parameters for the root run, as a JSON object.
    #[arg(long, env = "QUARRY_PARAMS", default_value = "{}", value_parser = parse_params)]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Storage root for events and sidecar files.
    #[arg(long, env = "QUARRY_OUT", default_value = "quarry-out")]
    pub out: PathBuf,

    /// Dataset the run writes into.
    #[arg(long, env = "QUARRY_DATASET", default_value = "default")]
    pub dataset: String,

    /// Source partition label.
    #[arg(long, env = "QUARRY_SOURCE", default_value = "default")]
    pub source: String,

    /// Category partition label.
    #[arg(long, env = "QUARRY_CATEGORY", default_value = "default")]
    pub category: String,

    /// Number of runs to execute in parallel.
    #[arg(
        short = 'p',
        long,
        env = "QUARRY_PARALLEL",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..=256)
    )]
    pub parallel: u16,

    /// Maximum depth of derived runs; the root is depth 0.
    #[arg(long, env = "QUARRY_MAX_DEPTH", default_value_t = 2)]
    pub max_depth: u32,

    /// Total run cap across the tree, the root included.
    #[arg(long, env = "QUARRY_MAX_RUNS", default_value_t = 100)]
    pub max_runs: u32,

    /// Module-resolution override exported to executors.
    #[arg(long, env = "QUARRY_MODULE_PATH")]
    pub module_path: Option<String>,

    /// Proxy server URL handed to executors.
    #[arg(long, env = "QUARRY_PROXY_SERVER")]
    pub proxy_server: Option<String>,

    /// Proxy username.
    #[arg(long, env = "QUARRY_PROXY_USERNAME")]
    pub proxy_username: Option<String>,

    /// Proxy password. Never surfaced in results or reports.
    #[arg(long, env = "QUARRY_PROXY_PASSWORD", hide_env_values = true)]
    pub proxy_password: Option<String>,
}
