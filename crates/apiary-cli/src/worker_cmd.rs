//! `apiary worker`: the one-shot subprocess entry point spawned by the
//! queen. Exit codes: 0 success, 1 run failure, 2 initialization failure.

use std::path::PathBuf;
use std::time::Duration;

use tracing::error;

use apiary_core::config::OrchestratorConfig;
use apiary_core::paths::Layout;
use apiary_core::worker::agent::AgentConfig;
use apiary_core::worker::workspace::WorkspaceMode;
use apiary_core::worker::{WorkerExit, WorkerInvocation, run_one_shot};
use apiary_db::config::DbConfig;
use apiary_db::pool;

#[allow(clippy::too_many_arguments)]
pub async fn run_worker(
    layout: &Layout,
    role: &str,
    one_shot: bool,
    task_id: &str,
    run_id: &str,
    phase: &str,
    mode: &str,
    workspace: Option<PathBuf>,
    live: bool,
) {
    if !one_shot {
        eprintln!("worker requires --one-shot (interactive mode is not supported)");
        std::process::exit(2);
    }

    let mode: WorkspaceMode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let config = match OrchestratorConfig::load(&layout.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e:#}");
            std::process::exit(2);
        }
    };

    let db_pool = match pool::create_pool(&DbConfig::new(layout.db_path())).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("failed to open database: {e}");
            std::process::exit(2);
        }
    };

    let agent_config = AgentConfig {
        binary: config.agent_binary.clone(),
        timeout: Duration::from_secs(config.worker_timeout_secs),
        kill_grace: Duration::from_secs(config.graceful_kill_secs),
    };

    let invocation = WorkerInvocation {
        role: role.to_owned(),
        task_id: task_id.to_owned(),
        run_id: run_id.to_owned(),
        phase: phase.to_owned(),
        mode,
        workspace_override: workspace,
        live_output: live,
    };

    let exit = match run_one_shot(&db_pool, layout, &agent_config, config.debug_mode, &invocation)
        .await
    {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker run failed");
            WorkerExit::Failure
        }
    };

    db_pool.close().await;
    std::process::exit(exit.code());
}
