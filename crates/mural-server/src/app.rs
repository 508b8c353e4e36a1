//! Simulation loop.
//!
//! Everything that touches worlds runs on one thread: a current-thread
//! runtime drives the tick, sweep and save timers. Chunk encoding happens
//! on the manager's render pool.

use anyhow::{bail, Context, Result};
use mural_world::WorldManager;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Runs the server until Ctrl-C.
pub fn run(config: ServerConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<()> {
    let mut manager = WorldManager::new(config.manager_config());

    let default_world = manager.default_world().to_string();
    manager
        .get_or_load_world(&default_world)
        .with_context(|| format!("Failed to open world {default_world:?}"))?;

    let mut tick = interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep = interval_at(Instant::now() + config.sweep_interval(), config.sweep_interval());
    let mut save = interval_at(Instant::now() + config.save_interval(), config.save_interval());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Serving worlds from {} (tick {} ms)",
        config.worlds_dir.display(),
        config.tick_interval_ms
    );

    loop {
        tokio::select! {
            _ = tick.tick() => manager.tick(),
            _ = sweep.tick() => {
                let evicted = manager.sweep();
                info!(
                    "Sweep: {evicted} chunks evicted, {} worlds, {} players, {:.1} TPS",
                    manager.loaded_worlds(),
                    manager.player_count(),
                    manager.tps()
                );
            },
            _ = save.tick() => {
                manager.save_all();
            },
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Ctrl-C handler failed: {e}");
                }
                info!("Shutdown requested");
                break;
            },
        }
    }

    let summary = manager.shutdown();
    if summary.has_failures() {
        bail!(
            "{} chunks and {} props files could not be saved",
            summary.chunks_failed,
            summary.props_failed
        );
    }
    Ok(())
}
