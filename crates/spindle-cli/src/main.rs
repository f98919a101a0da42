// SPDX-License-Identifier: MIT OR Apache-2.0
//! `spindle-thread`: CLI entry for the spindle kernel.
//!
//! `run` executes the thread-directive entry operation — it is also the
//! re-entry vehicle detached children are spawned with. `orchestrate`
//! drives the coordination operations. JSON is printed to stdout
//! regardless of outcome; exit code 0 on success, 1 on documented failure.
//!
//! The four primary tools are external collaborators: embedders register
//! their implementations on the dispatcher before running threads. This
//! binary starts with an empty dispatcher, so tool calls surface as
//! error results to the model.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use spindle_artifact::{ArtifactSigner, ArtifactStore, TrustStore};
use spindle_core::FrontMatterParser;
use spindle_dispatch::ToolDispatcher;
use spindle_orchestrator::{EntryInput, EntryInternal, Orchestrator, OrchestratorConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "spindle-thread", about = "Agent execution kernel CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a directive in a managed thread.
    Run {
        /// Entry input as JSON (`{"directive_id": …, "async": …, …}`).
        #[arg(long)]
        params: String,
        /// Project root.
        #[arg(long)]
        project_path: PathBuf,
        /// Pre-generated thread id (detached re-entry).
        #[arg(long)]
        thread_id: Option<String>,
        /// The parent process already registered the thread.
        #[arg(long, default_value_t = false)]
        pre_registered: bool,
    },
    /// Drive an orchestrator operation.
    Orchestrate {
        /// Operation name (`wait_threads`, `cancel_thread`, `kill_thread`,
        /// `get_status`, `list_active`, `aggregate_results`, `get_chain`,
        /// `chain_search`, `read_transcript`, `resume_thread`,
        /// `handoff_thread`).
        #[arg(long)]
        operation: String,
        /// Operation parameters as JSON.
        #[arg(long, default_value = "{}")]
        params: String,
        /// Project root.
        #[arg(long)]
        project_path: PathBuf,
    },
}

fn init_tracing() {
    let default = if std::env::var("SPINDLE_DEBUG").is_ok() {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(project_path: &Path) -> anyhow::Result<Arc<Orchestrator>> {
    let trust_path = project_path.join(".ai").join("config").join("trust_store.yaml");
    let trust = if trust_path.exists() {
        TrustStore::load(&trust_path).map_err(|e| anyhow::anyhow!(e))?
    } else {
        TrustStore::new()
    };

    let store = Arc::new(ArtifactStore::for_project(project_path, trust));
    let dispatcher = Arc::new(ToolDispatcher::new(project_path));
    let signer = Arc::new(load_or_create_signer(project_path)?);

    Orchestrator::new(
        OrchestratorConfig::new(project_path),
        store,
        dispatcher,
        signer,
        Arc::new(FrontMatterParser),
    )
}

/// Load the signing key from `~/.ai/keys/signing.key`, generating one on
/// first use.
fn load_or_create_signer(project_path: &Path) -> anyhow::Result<ArtifactSigner> {
    let key_path = dirs::home_dir()
        .unwrap_or_else(|| project_path.to_path_buf())
        .join(".ai")
        .join("keys")
        .join("signing.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path)
            .with_context(|| format!("read signing key {}", key_path.display()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing key has wrong length"))?;
        return Ok(ArtifactSigner::from_bytes(&arr));
    }
    let signer = ArtifactSigner::generate();
    tracing::warn!(
        target: "spindle.cli",
        path = %key_path.display(),
        fingerprint = %signer.fingerprint(),
        "no signing key found; generated an ephemeral one"
    );
    Ok(signer)
}

async fn orchestrate(
    orchestrator: Arc<Orchestrator>,
    operation: &str,
    params: Value,
) -> Value {
    let str_param = |key: &str| {
        params
            .get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
    };

    match operation {
        "wait_threads" => {
            let ids: Vec<String> = params
                .get("thread_ids")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let timeout = params
                .get("timeout")
                .and_then(Value::as_f64)
                .unwrap_or(600.0);
            let result = orchestrator
                .wait_threads(&ids, Duration::from_secs_f64(timeout))
                .await;
            json!({"success": result.success, "results": result.results})
        }
        "cancel_thread" => match str_param("thread_id") {
            Some(id) => match orchestrator.cancel_thread(&id) {
                Ok(()) => json!({"success": true, "cancelled": id}),
                Err(e) => json!({"success": false, "error": e}),
            },
            None => json!({"success": false, "error": "thread_id required"}),
        },
        "kill_thread" => match str_param("thread_id") {
            Some(id) => match orchestrator.kill_thread(&id).await {
                Ok(pid) => json!({"success": true, "killed": id, "pid": pid}),
                Err(e) => json!({"success": false, "error": e}),
            },
            None => json!({"success": false, "error": "thread_id required"}),
        },
        "get_status" => match str_param("thread_id") {
            Some(id) => orchestrator
                .get_status(&id)
                .map_or_else(
                    || json!({"success": false, "error": format!("thread not found: {id}")}),
                    |status| json!({"success": true, "status": status}),
                ),
            None => json!({"success": false, "error": "thread_id required"}),
        },
        "list_active" => {
            let active = orchestrator.list_active();
            json!({"success": true, "active_threads": active, "count": active.len()})
        }
        "aggregate_results" => {
            let ids: Vec<String> = params
                .get("thread_ids")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            json!({"success": true, "results": orchestrator.aggregate_results(&ids)})
        }
        "get_chain" => match str_param("thread_id") {
            Some(id) => {
                let chain: Vec<Value> = orchestrator
                    .registry()
                    .get_chain(&id)
                    .into_iter()
                    .map(|r| {
                        json!({
                            "thread_id": r.thread_id,
                            "status": r.status.as_str(),
                            "directive": r.directive_id,
                        })
                    })
                    .collect();
                json!({"success": true, "chain_length": chain.len(), "chain": chain})
            }
            None => json!({"success": false, "error": "thread_id required"}),
        },
        "chain_search" => {
            let (Some(id), Some(query)) = (str_param("thread_id"), str_param("query")) else {
                return json!({"success": false, "error": "thread_id and query required"});
            };
            let search_type = str_param("search_type").unwrap_or_else(|| "text".to_string());
            let max_results = params
                .get("max_results")
                .and_then(Value::as_u64)
                .unwrap_or(50) as usize;
            match orchestrator.chain_search(&id, &query, &search_type, max_results) {
                Ok(matches) => json!({"success": true, "matches": matches}),
                Err(e) => json!({"success": false, "error": e}),
            }
        }
        "read_transcript" => match str_param("thread_id") {
            Some(id) => {
                let tail = params
                    .get("tail_lines")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize);
                match orchestrator.read_transcript(&id, tail) {
                    Ok(content) => json!({"success": true, "thread_id": id, "content": content}),
                    Err(e) => json!({"success": false, "error": e}),
                }
            }
            None => json!({"success": false, "error": "thread_id required"}),
        },
        "resume_thread" => {
            let (Some(id), Some(message)) = (str_param("thread_id"), str_param("message")) else {
                return json!({"success": false, "error": "thread_id and message required"});
            };
            match orchestrator.resume_thread(&id, &message).await {
                Ok(new_id) => json!({
                    "success": true,
                    "resumed": true,
                    "old_thread_id": id,
                    "new_thread_id": new_id,
                }),
                Err(e) => json!({"success": false, "error": e}),
            }
        }
        "handoff_thread" => match str_param("thread_id") {
            Some(id) => match orchestrator.handoff(&id, None).await {
                Ok(new_id) => json!({
                    "success": true,
                    "old_thread_id": id,
                    "new_thread_id": new_id,
                }),
                Err(e) => json!({"success": false, "error": e}),
            },
            None => json!({"success": false, "error": "thread_id required"}),
        },
        other => json!({"success": false, "error": format!("unknown operation: {other}")}),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let output = match cli.command {
        Command::Run {
            params,
            project_path,
            thread_id,
            pre_registered,
        } => run_command(&params, &project_path, thread_id, pre_registered).await,
        Command::Orchestrate {
            operation,
            params,
            project_path,
        } => match serde_json::from_str::<Value>(&params) {
            Ok(parsed) => match build_orchestrator(&project_path) {
                Ok(orchestrator) => orchestrate(orchestrator, &operation, parsed).await,
                Err(e) => json!({"success": false, "error": e.to_string()}),
            },
            Err(e) => json!({"success": false, "error": format!("invalid params JSON: {e}")}),
        },
    };

    let success = output
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    println!("{output}");
    std::process::exit(i32::from(!success));
}

async fn run_command(
    params: &str,
    project_path: &Path,
    thread_id: Option<String>,
    pre_registered: bool,
) -> Value {
    let input: EntryInput = match serde_json::from_str(params) {
        Ok(input) => input,
        Err(e) => return json!({"success": false, "error": format!("invalid params: {e}")}),
    };
    let orchestrator = match build_orchestrator(project_path) {
        Ok(orchestrator) => orchestrator,
        Err(e) => return json!({"success": false, "error": e.to_string()}),
    };
    let result = orchestrator
        .run_directive(
            input,
            EntryInternal {
                thread_id_override: thread_id,
                pre_registered,
                continuation_message: None,
            },
        )
        .await;
    serde_json::to_value(&result).unwrap_or_else(|e| {
        json!({"success": false, "error": format!("result serialisation failed: {e}")})
    })
}
