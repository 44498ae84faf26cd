//! genq CLI: operator interface to the generation task queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use genq::config::Config;
use genq::config::secrets::ExposeSecret;
use genq::db::Db;
use genq::engine::{QueueRuntime, Watchdog};
use genq::handler;
use genq::model::{NewTask, Task, TaskFilter, TaskId, TaskKind, TaskStatus};
use genq::status::Artifacts;
use genq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "genq", about = "Durable task queue for content generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool and watchdog
    Serve {
        /// Directory containing handler TOML configs
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
        /// Number of workers (overrides QUEUE_WORKER_COUNT)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Whole-queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Resolve the effective status of an owner's work
    Resolve {
        #[arg(value_parser = parse_kind)]
        kind: TaskKind,
        owner: String,
        #[arg(long)]
        sub_owner: Option<String>,
        /// Artifacts already persisted for this work
        #[arg(long, default_value_t = 0)]
        produced: u64,
        /// Artifacts that make the work complete
        #[arg(long, default_value_t = 1)]
        expected: u64,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a task, replacing any queued task with the same key
    Enqueue {
        #[arg(value_parser = parse_kind)]
        kind: TaskKind,
        owner: String,
        #[arg(long)]
        sub_owner: Option<String>,
        /// Priority (lower = served first)
        #[arg(long, default_value_t = genq::model::task::DEFAULT_PRIORITY)]
        priority: i32,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Enqueue sibling tasks for one key in one transaction
    EnqueueBatch {
        #[arg(value_parser = parse_kind)]
        kind: TaskKind,
        owner: String,
        #[arg(long)]
        sub_owner: Option<String>,
        #[arg(long, default_value_t = genq::model::task::DEFAULT_PRIORITY)]
        priority: i32,
        /// JSON payload, repeat once per task
        #[arg(long = "payload", required = true)]
        payloads: Vec<String>,
    },
    /// List tasks
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<TaskStatus>,
        #[arg(long, value_parser = parse_kind)]
        kind: Option<TaskKind>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
    /// Delete one task in any status
    Delete {
        id: String,
    },
    /// Cancel queued tasks matching a filter
    Cancel {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<TaskKind>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        sub_owner: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Task counts by status
    Status,
    /// Remove ready and error tasks
    ClearCompleted,
    /// Remove every task
    ClearAll,
    /// Run one watchdog sweep now
    Sweep,
}

fn parse_kind(s: &str) -> Result<TaskKind, String> {
    s.parse().map_err(|e: genq::error::Error| e.to_string())
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    s.parse().map_err(|e: genq::error::Error| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { handlers, workers } => cmd_serve(config, handlers, workers).await,
        Command::Task { action } => cmd_task(&connect(&config).await?, action).await,
        Command::Queue { action } => {
            cmd_queue(&connect(&config).await?, &config, action).await
        }
        Command::Resolve {
            kind,
            owner,
            sub_owner,
            produced,
            expected,
        } => {
            let db = connect(&config).await?;
            let artifacts = Artifacts::new(produced, expected);
            let status = match sub_owner {
                Some(sub) => {
                    db.resolve_subowner_status(&owner, &sub, kind, artifacts)
                        .await?
                }
                None => db.resolve_owner_status(&owner, kind, artifacts).await?,
            };
            println!("{status}");
            Ok(())
        }
    }
}

/// Short-lived connection for one-shot commands.
async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect_with(config.database_url.expose_secret(), 2).await?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_serve(
    mut config: Config,
    handlers: PathBuf,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    if let Some(workers) = workers {
        anyhow::ensure!(workers > 0, "--workers must be at least 1");
        config.queue.worker_count = workers;
    }

    let max_connections = config.max_connections.max(config.queue.min_connections());
    let db = Db::connect_with(config.database_url.expose_secret(), max_connections).await?;
    db.migrate().await?;

    let registry = handler::load_from_dir(&handlers)?.build()?;

    let runtime = QueueRuntime::new(Arc::new(db), Arc::new(registry), config.queue);

    let rt = runtime.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        rt.shutdown();
    });

    runtime.run().await?;
    Ok(())
}

async fn cmd_task(db: &Db, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Enqueue {
            kind,
            owner,
            sub_owner,
            priority,
            payload,
        } => {
            let mut new = NewTask::new(kind, owner)
                .priority(priority)
                .payload(parse_payload(payload.as_deref())?);
            if let Some(sub) = sub_owner {
                new = new.sub_owner(sub);
            }
            let id = db.enqueue(new).await?;
            println!("Enqueued: {} ({})", id.0, kind);
        }
        TaskAction::EnqueueBatch {
            kind,
            owner,
            sub_owner,
            priority,
            payloads,
        } => {
            let payloads = payloads
                .iter()
                .map(|p| parse_payload(Some(p)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let requested = payloads.len();
            let ids = db
                .enqueue_batch(kind, priority, &owner, sub_owner.as_deref(), payloads)
                .await?;
            for id in &ids {
                println!("Enqueued: {}", id.0);
            }
            if ids.len() < requested {
                println!("Skipped {} duplicate payload(s)", requested - ids.len());
            }
        }
        TaskAction::List {
            status,
            kind,
            limit,
        } => {
            let tasks = db.list_tasks(status, kind, limit).await?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }

            println!(
                "{:<8}  {:<12}  {:<10}  {:<3}  {:<20}  {:<20}  CREATED",
                "ID", "KIND", "STATUS", "PRI", "OWNER", "SUB_OWNER"
            );
            println!("{}", "-".repeat(100));
            for task in &tasks {
                println!(
                    "{:<8}  {:<12}  {:<10}  {:<3}  {:<20}  {:<20}  {}",
                    task.id,
                    task.kind_name,
                    task.status,
                    task.priority,
                    truncate(&task.owner_id, 20),
                    truncate(task.sub_owner_id.as_deref().unwrap_or("-"), 20),
                    task.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} task(s)", tasks.len());
        }
        TaskAction::Show { id } => {
            let task = find_task(db, &id).await?;
            print_task(&task)?;
        }
        TaskAction::Delete { id } => {
            let task = find_task(db, &id).await?;
            if db.delete_task(task.id).await? {
                println!("Deleted: {}", task.id.0);
            }
        }
        TaskAction::Cancel {
            kind,
            owner,
            sub_owner,
        } => {
            let filter = TaskFilter {
                kind,
                owner_id: owner,
                sub_owner_id: sub_owner,
            };
            let deleted = db.delete_tasks(&filter).await?;
            println!("Cancelled {deleted} queued task(s)");
        }
    }
    Ok(())
}

async fn cmd_queue(db: &Db, config: &Config, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Status => {
            let counts = db.counts_by_status().await?;
            println!("Total:       {}", counts.total);
            println!("Queued:      {}", counts.queued);
            println!("Processing:  {}", counts.processing);
            println!("Ready:       {}", counts.ready);
            println!("Error:       {}", counts.error);
        }
        QueueAction::ClearCompleted => {
            println!("Cleared {} completed task(s)", db.clear_completed().await?);
        }
        QueueAction::ClearAll => {
            println!("Cleared {} task(s)", db.clear_all().await?);
        }
        QueueAction::Sweep => {
            let watchdog = Watchdog::new(Arc::new(db.clone()), config.queue.watchdog_interval);
            let expired = watchdog.tick().await?;
            println!("Timed out {} task(s)", expired.len());
        }
    }
    Ok(())
}

fn parse_payload(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(json) => Ok(serde_json::from_str(json)?),
        None => Ok(serde_json::json!({})),
    }
}

/// Resolve a full UUID or a unique prefix.
async fn find_task(db: &Db, id: &str) -> anyhow::Result<Task> {
    if let Ok(uuid) = uuid::Uuid::parse_str(id) {
        return Ok(db.get_task(TaskId(uuid)).await?);
    }
    let mut matches = db.find_tasks_by_prefix(id, 2).await?;
    match matches.len() {
        0 => anyhow::bail!("no task matching prefix '{id}'"),
        1 => Ok(matches.remove(0)),
        _ => anyhow::bail!("several tasks match prefix '{id}', be more specific"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn print_task(task: &Task) -> anyhow::Result<()> {
    println!("ID:          {}", task.id.0);
    println!("Kind:        {}", task.kind_name);
    println!("Status:      {}", task.status);
    println!("Priority:    {}", task.priority);
    println!("Owner:       {}", task.owner_id);
    println!(
        "Sub-owner:   {}",
        task.sub_owner_id.as_deref().unwrap_or("-")
    );
    if let Some(ref disc) = task.discriminator {
        println!("Variant:     {disc}");
    }
    println!("Payload:     {}", serde_json::to_string_pretty(&task.payload)?);
    println!("Attempts:    {}", task.attempts);
    println!("Created:     {}", task.created_at);
    if let Some(started) = task.started_at {
        println!("Started:     {started}");
    }
    if task.status == TaskStatus::Processing {
        if task.lease_active(chrono::Utc::now()) {
            println!("Lease until: {}", task.timeout_at);
        } else {
            println!("Lease:       expired {} (awaiting watchdog)", task.timeout_at);
        }
    }
    if let Some(completed) = task.completed_at {
        println!("Completed:   {completed}");
    }
    if let Some(ref err) = task.error_message {
        println!("Error:       {err}");
    }
    Ok(())
}
