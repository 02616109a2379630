//! `flowgate` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a workflow JSON file.
//! - `run`      — run a workflow file in-process against in-memory stores.
//! - `import`   — store a workflow file in the database.
//! - `list`     — list stored workflows.
//! - `submit`   — queue a run of a stored workflow.
//! - `worker`   — start a queue worker.
//! - `status`   — show one execution.
//! - `cancel`   — cancel a pending or running execution.
//! - `report`   — print the execution analysis of a workflow.
//! - `migrate`  — run pending database migrations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use engine::clock::{Clock, SystemClock};
use engine::memory::{MemoryCache, MemoryExecutionStore, MemoryWorkflowStore};
use engine::probe::ProcfsProbe;
use engine::{EngineConfig, Governor, MetricsAnalyzer, RunOptions, WorkflowRecord};
use nodes::{NodeRegistry, StaticOutputExecutor};

#[derive(Parser)]
#[command(name = "flowgate", about = "Governed workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Database {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, default_value_t = 10)]
    max_connections: u32,
}

#[derive(Args)]
struct RunArgs {
    /// Trigger payload as a JSON object.
    #[arg(long, default_value = "{}")]
    payload: String,
    #[arg(long)]
    user_id: Option<i64>,
    /// Requested run timeout in seconds.
    #[arg(long)]
    timeout: Option<i64>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a workflow file in-process; effectful nodes return their configured `output`.
    Run {
        path: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        /// Engine configuration (TOML).
        #[arg(long, env = "FLOWGATE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Store a workflow definition file and print its id.
    Import {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        timeout_secs: Option<i64>,
        #[command(flatten)]
        database: Database,
    },
    /// List stored workflows, newest first.
    List {
        #[command(flatten)]
        database: Database,
    },
    /// Admit a run of a stored workflow and queue it for a worker.
    Submit {
        workflow_id: Uuid,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, env = "FLOWGATE_CONFIG")]
        config: Option<PathBuf>,
        #[command(flatten)]
        database: Database,
    },
    /// Start a background worker that processes queued jobs.
    Worker {
        #[arg(long, env = "FLOWGATE_CONFIG")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,
        #[command(flatten)]
        database: Database,
    },
    /// Show one execution.
    Status {
        execution_id: Uuid,
        #[command(flatten)]
        database: Database,
    },
    /// Cancel a pending or running execution.
    Cancel {
        execution_id: Uuid,
        #[command(flatten)]
        database: Database,
    },
    /// Print the execution analysis of a workflow as JSON.
    Report {
        workflow_id: Uuid,
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[command(flatten)]
        database: Database,
    },
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        database: Database,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path, run } => {
            let definition = read_json(&path)?;
            let (payload, options) = run.parse()?;
            let report = engine::validate(&definition, &payload, &options);
            if report.valid {
                println!("Workflow is valid.");
            } else {
                eprintln!("Validation failed:");
                for error in &report.errors {
                    eprintln!("  - {error}");
                }
                std::process::exit(1);
            }
        }
        Command::Run { path, run, config } => {
            let definition = read_json(&path)?;
            let (payload, options) = run.parse()?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workflow".to_string());

            let workflows = Arc::new(MemoryWorkflowStore::new());
            let workflow_id = workflows.insert(WorkflowRecord::new(name, definition));
            let governor = Governor::new(
                load_config(config.as_deref())?,
                workflows,
                Arc::new(MemoryExecutionStore::new()),
                Arc::new(MemoryCache::new()),
                registry(),
                Arc::new(ProcfsProbe::new()),
                Arc::new(SystemClock),
            );

            let result = governor.execute(workflow_id, payload, options).await?;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Import { path, name, timeout_secs, database } => {
            let definition = read_json(&path)?;
            let name = name
                .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "workflow".to_string());

            let pool = database.connect().await?;
            let row = db::repository::workflows::create_workflow(&pool, &name, definition, timeout_secs)
                .await
                .context("failed to store workflow")?;
            info!(workflow_id = %row.id, name = %row.name, "workflow imported");
            println!("{}", row.id);
        }
        Command::List { database } => {
            let pool = database.connect().await?;
            for row in db::repository::workflows::list_workflows(&pool).await? {
                let state = if row.is_active { "active" } else { "inactive" };
                println!("{}  {:<8}  {}", row.id, state, row.name);
            }
        }
        Command::Submit { workflow_id, run, config, database } => {
            let (payload, options) = run.parse()?;
            let pool = database.connect().await?;
            let governor = pg_governor(&pool, load_config(config.as_deref())?, 3);

            let job_id = governor.submit(workflow_id, payload, options).await?;
            println!("{job_id}");
        }
        Command::Worker { config, poll_interval_ms, max_attempts, database } => {
            let pool = database.connect().await?;
            let jobs = Arc::new(db::PgJobQueue::new(pool.clone(), max_attempts));
            let governor = Arc::new(pg_governor(&pool, load_config(config.as_deref())?, max_attempts));
            let worker = queue::Worker::new(jobs, governor, Duration::from_millis(poll_interval_ms));

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                signal.cancel();
            });

            worker.run(shutdown).await;
        }
        Command::Status { execution_id, database } => {
            let pool = database.connect().await?;
            let governor = pg_governor(&pool, EngineConfig::default(), 3);
            print_json(&governor.status(execution_id).await?)?;
        }
        Command::Cancel { execution_id, database } => {
            let pool = database.connect().await?;
            let governor = pg_governor(&pool, EngineConfig::default(), 3);
            let outcome = governor.cancel(execution_id).await?;
            print_json(&outcome)?;
        }
        Command::Report { workflow_id, days, database } => {
            let pool = database.connect().await?;
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let analyzer = MetricsAnalyzer::new(Arc::new(db::PgExecutionStore::new(pool)), clock);
            print_json(&analyzer.report(workflow_id, days).await?)?;
        }
        Command::Migrate { database } => {
            let pool = database.connect().await?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("Migrations applied successfully");
        }
    }

    Ok(())
}

impl Database {
    async fn connect(&self) -> Result<db::DbPool> {
        db::pool::create_pool(&self.database_url, self.max_connections)
            .await
            .context("failed to connect to database")
    }
}

impl RunArgs {
    fn parse(&self) -> Result<(engine::Context, RunOptions)> {
        let payload = match serde_json::from_str::<Value>(&self.payload)
            .context("--payload is not valid JSON")?
        {
            Value::Object(map) => map,
            other => bail!("--payload must be a JSON object, got {other}"),
        };
        let options = RunOptions {
            user_id: self.user_id,
            timeout: self.timeout,
            trigger_type: Some("manual".to_string()),
            ..RunOptions::default()
        };
        Ok((payload, options))
    }
}

/// Every action key resolves to the static executor: nodes report their
/// configured `output` without side effects.
fn registry() -> Arc<NodeRegistry> {
    Arc::new(NodeRegistry::new().with_fallback(Arc::new(StaticOutputExecutor)))
}

fn pg_governor(pool: &db::DbPool, config: EngineConfig, max_attempts: u32) -> Governor {
    Governor::new(
        config,
        Arc::new(db::PgWorkflowStore::new(pool.clone())),
        Arc::new(db::PgExecutionStore::new(pool.clone())),
        Arc::new(MemoryCache::new()),
        registry(),
        Arc::new(ProcfsProbe::new()),
        Arc::new(SystemClock),
    )
    .with_dispatcher(Arc::new(db::PgJobQueue::new(pool.clone(), max_attempts)))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::load(path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
