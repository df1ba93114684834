mod log_cmd;
mod queen_cmd;
mod review_cmd;
mod status_cmd;
mod task_cmds;
mod worker_cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;

use apiary_core::paths::Layout;
use apiary_db::config::DbConfig;
use apiary_db::pool;

#[derive(Parser)]
#[command(name = "apiary", about = "Orchestrator that drives CLI coding agents through multi-phase task workflows")]
struct Cli {
    /// Project root (overrides the APIARY_ROOT env var; defaults to cwd)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create directories and initialize the database schema
    Init,
    /// Print task counts by status (and per-task detail with -v)
    Status {
        /// Show per-task detail
        #[arg(short, long)]
        verbose: bool,
    },
    /// Create a new task in the queue
    CreateTask {
        /// Human-readable task title
        title: String,
        /// Detailed description
        #[arg(long, default_value = "")]
        description: String,
        /// Task type (planned_subtask triggers dependency gating)
        #[arg(long, default_value = "general")]
        task_type: String,
        /// Priority; higher runs first
        #[arg(long, default_value_t = 1)]
        priority: i64,
        /// Retry ceiling
        #[arg(long, default_value_t = 3)]
        max_retries: i64,
        /// Tags; the first one may name a worker role
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Workspace mode: fresh or repo
        #[arg(long, default_value = "repo")]
        mode: String,
    },
    /// Mark an existing task as queued
    Queue {
        task_id: String,
    },
    /// Tabulate tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Remove a task's workspace, results, and logs; reset it to queued
    Clear {
        task_id: String,
    },
    /// Reset a task to queued and clear assignment fields
    Reset {
        task_id: String,
    },
    /// Dump run logs for a task
    Logs {
        task_id: String,
        /// Show only the most recent log
        #[arg(long)]
        latest: bool,
        /// Show only the last N lines of each log
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Emit the stored transcript for a run
    GetTranscript {
        run_id: String,
    },
    /// Emit the next task awaiting review
    ReviewNextTask {
        /// Output format: json or summary
        #[arg(long, default_value = "summary")]
        format: String,
    },
    /// Record a review decision and transition the task
    CompleteReview {
        task_id: String,
        /// approve, reject, or rework
        #[arg(long)]
        decision: String,
        /// Reason for the decision
        #[arg(long)]
        reason: Option<String>,
        /// Override the next phase
        #[arg(long)]
        next_phase: Option<String>,
    },
    /// Run the scheduling loop
    Queen {
        /// Stream child worker output to the terminal
        #[arg(long)]
        live: bool,
    },
    /// Execute one (task, phase) assignment and exit (spawned by the queen)
    Worker {
        /// Worker role: backend, frontend, or infra
        role: String,
        /// One-shot mode (the only supported mode)
        #[arg(long)]
        one_shot: bool,
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        run_id: String,
        /// Execution phase
        #[arg(long, default_value = "apply")]
        phase: String,
        /// Workspace mode: fresh or repo
        #[arg(long, default_value = "repo")]
        mode: String,
        /// Explicit workspace directory
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Stream agent output to the terminal
        #[arg(long)]
        live: bool,
    },
}

/// Open the pool over the layout's database file.
async fn open_pool(layout: &Layout) -> Result<SqlitePool> {
    let config = DbConfig::new(layout.db_path());
    Ok(pool::create_pool(&config).await?)
}

/// Execute `apiary init`: create directories, initialize the schema.
async fn cmd_init(layout: &Layout) -> Result<()> {
    println!("Initializing apiary at {}...", layout.root().display());
    layout.ensure_directories()?;

    let db_pool = open_pool(layout).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }
    db_pool.close().await;

    println!("apiary init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let layout = Layout::discover(cli.root.as_deref());

    match cli.command {
        Commands::Init => {
            cmd_init(&layout).await?;
        }
        Commands::Status { verbose } => {
            let db_pool = open_pool(&layout).await?;
            let result = status_cmd::run_status(&db_pool, verbose).await;
            db_pool.close().await;
            result?;
        }
        Commands::CreateTask {
            title,
            description,
            task_type,
            priority,
            max_retries,
            tags,
            mode,
        } => {
            let db_pool = open_pool(&layout).await?;
            let result = task_cmds::run_create_task(
                &db_pool,
                &title,
                &description,
                &task_type,
                priority,
                max_retries,
                &tags,
                &mode,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Queue { task_id } => {
            let db_pool = open_pool(&layout).await?;
            let result = task_cmds::run_queue(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::List { status } => {
            let db_pool = open_pool(&layout).await?;
            let result = task_cmds::run_list(&db_pool, status.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Clear { task_id } => {
            let db_pool = open_pool(&layout).await?;
            let result = task_cmds::run_clear(&db_pool, &layout, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Reset { task_id } => {
            let db_pool = open_pool(&layout).await?;
            let result = task_cmds::run_reset(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Logs {
            task_id,
            latest,
            tail,
        } => {
            log_cmd::run_logs(&layout, &task_id, latest, tail)?;
        }
        Commands::GetTranscript { run_id } => {
            let db_pool = open_pool(&layout).await?;
            let result = log_cmd::run_get_transcript(&db_pool, &layout, &run_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::ReviewNextTask { format } => {
            let db_pool = open_pool(&layout).await?;
            let result = review_cmd::run_review_next_task(&db_pool, &format).await;
            db_pool.close().await;
            result?;
        }
        Commands::CompleteReview {
            task_id,
            decision,
            reason,
            next_phase,
        } => {
            let db_pool = open_pool(&layout).await?;
            let result = review_cmd::run_complete_review(
                &db_pool,
                &task_id,
                &decision,
                reason.as_deref(),
                next_phase.as_deref(),
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Queen { live } => {
            queen_cmd::run_queen(&layout, live).await?;
        }
        Commands::Worker {
            role,
            one_shot,
            task_id,
            run_id,
            phase,
            mode,
            workspace,
            live,
        } => {
            worker_cmd::run_worker(
                &layout, &role, one_shot, &task_id, &run_id, &phase, &mode, workspace, live,
            )
            .await;
        }
    }

    Ok(())
}
