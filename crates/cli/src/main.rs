//! `flowrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `run`: execute a workflow file in-process and print its records.
//! - `validate`: validate a workflow JSON file.
//! - `register`: store a workflow definition in Postgres.
//! - `submit`: write a pending run request to Postgres.
//! - `worker`: pick up pending runs from Postgres and execute them.
//! - `migrate`: run pending database migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use db::{ExecutionRecord, ExecutionStatus, ExecutionStore, MemoryStore, PgStore, WorkflowStore};
use engine::{
    validate_workflow, BranchPolicy, ExecutorConfig, GraphExecutor, LaneRouter, NoopNotifier,
    Notifier, RunOptions, Runtime, WorkflowDefinition,
};
use nodes::NodeRegistry;
use queue::config::{CONNECTOR_CALLS, LLM_PROCESSING, WORKFLOW_EXECUTION};
use queue::{JobQueue, QueueConfig};

#[derive(Parser)]
#[command(name = "flowrun", about = "Workflow execution runtime", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow file in-process and print the resulting records.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Trigger payload (JSON).
        #[arg(long, default_value = "{}")]
        input: String,
        /// Seed variables (JSON object).
        #[arg(long, default_value = "{}")]
        vars: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Store a workflow definition.
    Register {
        /// Path to the workflow JSON file.
        path: PathBuf,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Record a pending run of a stored workflow for a worker to pick up.
    Submit {
        workflow_id: Uuid,
        /// Trigger payload (JSON).
        #[arg(long, default_value = "{}")]
        input: String,
        /// Seed variables (JSON object).
        #[arg(long, default_value = "{}")]
        vars: String,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Execute pending runs until interrupted.
    Worker {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// How often to look for pending runs.
        #[arg(long, env = "RUNTIME_POLL_INTERVAL_MS", default_value_t = 1000)]
        poll_interval_ms: u64,
        /// Pending runs picked up per poll.
        #[arg(long, env = "RUNTIME_POLL_BATCH", default_value_t = 50)]
        batch: u32,
        #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
        max_connections: u32,
        /// Seconds to wait for runs in flight on shutdown.
        #[arg(long, env = "RUNTIME_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
        shutdown_grace_secs: u64,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

/// Knobs shared by every command that executes runs.
#[derive(Args)]
struct RuntimeArgs {
    #[arg(long, env = "RUNTIME_WORKFLOW_CONCURRENCY", default_value_t = 5)]
    workflow_concurrency: usize,
    #[arg(long, env = "RUNTIME_LLM_CONCURRENCY", default_value_t = 2)]
    llm_concurrency: usize,
    #[arg(long, env = "RUNTIME_CONNECTOR_CONCURRENCY", default_value_t = 5)]
    connector_concurrency: usize,
    /// Follow only the edge matching a condition node's branch.
    #[arg(long, env = "RUNTIME_MATCH_BRANCHES")]
    match_branches: bool,
    /// Keep going after node errors unless a node says otherwise.
    #[arg(long, env = "RUNTIME_CONTINUE_ON_ERROR")]
    continue_on_error: bool,
    /// Seconds a running run may go without a heartbeat before another
    /// worker takes it over.
    #[arg(long, env = "RUNTIME_LEASE_SECS", default_value_t = 30)]
    lease_secs: u64,
}

impl RuntimeArgs {
    fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_concurrency(WORKFLOW_EXECUTION, self.workflow_concurrency)
            .with_concurrency(LLM_PROCESSING, self.llm_concurrency)
            .with_concurrency(CONNECTOR_CALLS, self.connector_concurrency)
    }

    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            branch_policy: if self.match_branches {
                BranchPolicy::MatchBranch
            } else {
                BranchPolicy::FollowAll
            },
            continue_on_error: self.continue_on_error,
            lease: Duration::from_secs(self.lease_secs.max(1)),
        }
    }

    /// Queue, built-in handlers with outbound HTTP on its own lane, and the
    /// runtime over `workflows`/`executions`.
    fn build<S>(&self, store: Arc<S>) -> Result<Runtime>
    where
        S: WorkflowStore + ExecutionStore + 'static,
    {
        let queue = JobQueue::new(self.queue_config());
        let mut registry = NodeRegistry::with_builtins();
        let mut router = LaneRouter::new(queue.clone());
        router.route(&mut registry, "api", CONNECTOR_CALLS)?;
        router.start()?;

        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let executor = Arc::new(GraphExecutor::new(
            Arc::new(registry),
            store.clone(),
            notifier.clone(),
            self.executor_config(),
        ));
        Ok(Runtime::new(queue, store.clone(), store, executor, notifier))
    }
}

fn read_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let json: Value = serde_json::from_str(&content).context("invalid JSON")?;
    Ok(WorkflowDefinition::from_json(json)?)
}

fn parse_json(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{flag} is not valid JSON"))
}

fn parse_vars(raw: &str) -> Result<Map<String, Value>> {
    match parse_json("vars", raw)? {
        Value::Object(map) => Ok(map),
        _ => bail!("--vars must be a JSON object"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            input,
            vars,
            runtime,
        } => {
            let workflow = read_workflow(&path)?;
            let store = Arc::new(MemoryStore::new());
            store.save_workflow(&workflow.to_row()?).await?;

            let rt = runtime.build(store)?;
            rt.start()?;
            let options = RunOptions {
                variables: parse_vars(&vars)?,
                ..Default::default()
            };
            let run = rt
                .submit_run(workflow.id, parse_json("input", &input)?, options)
                .await?;
            let job = run.job.wait().await;
            if let Some(error) = &job.error {
                warn!(%error, "run job failed");
            }

            let report = rt.report(run.execution_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.execution.status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }
        Command::Validate { path } => {
            let workflow = read_workflow(&path)?;
            match validate_workflow(&workflow, &NodeRegistry::with_builtins()) {
                Ok(()) => println!(
                    "Workflow '{}' is valid ({} nodes, {} edges).",
                    workflow.name,
                    workflow.nodes.len(),
                    workflow.edges.len()
                ),
                Err(e) => {
                    eprintln!("Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Register { path, database_url } => {
            let workflow = read_workflow(&path)?;
            let pool = db::create_pool(&database_url, 2).await?;
            PgStore::new(pool).save_workflow(&workflow.to_row()?).await?;
            println!("{}", workflow.id);
        }
        Command::Submit {
            workflow_id,
            input,
            vars,
            database_url,
        } => {
            let pool = db::create_pool(&database_url, 2).await?;
            let store = PgStore::new(pool);
            store
                .get_workflow(workflow_id)
                .await
                .with_context(|| format!("workflow {workflow_id}"))?;

            let input = json!({
                "trigger": parse_json("input", &input)?,
                "variables": parse_vars(&vars)?,
            });
            let record = ExecutionRecord::new(workflow_id, input);
            store.create_execution(&record).await?;
            println!("{}", record.id);
        }
        Command::Worker {
            database_url,
            poll_interval_ms,
            batch,
            max_connections,
            shutdown_grace_secs,
            runtime,
        } => {
            let pool = db::create_pool(&database_url, max_connections).await?;
            let rt = runtime.build(Arc::new(PgStore::new(pool)))?;
            let watcher = rt.start()?;
            info!(poll_interval_ms, batch, "worker started");

            let mut ticker = tokio::time::interval(Duration::from_millis(poll_interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = rt.poll_pending(batch).await {
                            warn!(error = %e, "polling pending runs failed");
                        }
                    }
                }
            }

            info!(grace_secs = shutdown_grace_secs, "shutting down worker");
            rt.shutdown(Duration::from_secs(shutdown_grace_secs)).await;
            watcher.abort();
        }
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::create_pool(&database_url, 2).await?;
            db::run_migrations(&pool).await?;
            info!("Migrations applied successfully");
        }
    }

    Ok(())
}
