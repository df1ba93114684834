//! `apiary queen`: run the scheduling loop until the work settles or the
//! operator interrupts (exit code 130).

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use apiary_core::bus::EventBus;
use apiary_core::config::OrchestratorConfig;
use apiary_core::paths::Layout;
use apiary_core::queen::Queen;
use apiary_db::config::DbConfig;
use apiary_db::pool;

pub async fn run_queen(layout: &Layout, live: bool) -> Result<()> {
    let config = OrchestratorConfig::load(&layout.config_path())?;
    layout.ensure_directories()?;

    let db_pool = pool::create_pool(&DbConfig::new(layout.db_path())).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let bus = Arc::new(EventBus::new(db_pool.clone()));
    let mut queen = Queen::new(db_pool.clone(), bus, config, layout.clone())
        .with_live_output(live);
    queen.startup().await?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    let result = queen.run(cancel.clone()).await;
    db_pool.close().await;
    result?;

    if cancel.is_cancelled() {
        std::process::exit(130);
    }
    Ok(())
}
