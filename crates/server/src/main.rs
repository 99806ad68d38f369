//! Process entry point: load config, init logging, stand up the room
//! directory, and idle until shutdown.
//!
//! No client-facing HTTP surface is started here — the federation and
//! signing collaborators a real deployment needs to spawn room actors live
//! outside this crate (§1's named collaborators). This binary only proves
//! out the ambient stack (config, logging, the registry) the way the
//! teacher's `crates/server` binary proves out its own.

mod config;
mod logging;

use std::path::PathBuf;

use clap::Parser;
use room_engine_actor::{Registry, RoomActorHandle, Supervisor};
use room_engine_core::RoomId;
use tracing::info;

use config::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "room-engine-server")]
struct Args {
    #[arg(long, default_value = "room-engine.toml")]
    config: PathBuf,
}

/// Declines to start any room, matching the `(ok, undefined)` convention
/// `Registry::get_room_pid` documents — a real deployment supplies a
/// supervisor that actually spawns `room_actor::spawn` with concrete
/// `FederationClient`/`SigningService` implementations.
struct NullSupervisor;

#[async_trait::async_trait]
impl Supervisor for NullSupervisor {
    async fn start_room(&self, room_id: &RoomId) -> Option<RoomActorHandle> {
        info!(%room_id, "no supervisor configured, declining to start room");
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::load(&args.config)?;
    logging::init(&config);

    info!(
        server_name = %config.server_name,
        room_version = %config.room_version,
        "room engine starting"
    );

    let registry = Registry::new();
    let supervisor = NullSupervisor;

    let probe_room = RoomId::parse(format!("!probe:{}", config.server_name))?;
    let handle = registry.get_room_pid(&probe_room, &supervisor).await;
    info!(found = handle.is_some(), "registry probe complete");

    info!("room engine ready, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");

    Ok(())
}
