mod logging;
mod loopback;

use std::{env, sync::Arc, time::Duration};

use client_core::{Client, ClientConfig, SyncState};
use client_platform::InMemoryStore;
use tracing::{error, info};

use crate::loopback::LoopbackTransport;

const DEFAULT_USER: &str = "@smoke:localhost";
const DEFAULT_RUN_SECS: u64 = 20;
const ONLINE_SYNCS: usize = 3;

#[tokio::main]
async fn main() {
    logging::init();

    let mut config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    if config.user_id.is_empty() {
        config.user_id = DEFAULT_USER.to_owned();
    }
    let run_for = env::var("ROOMSYNC_SMOKE_SECS")
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(DEFAULT_RUN_SECS);

    let client = Client::new(
        config,
        Arc::new(LoopbackTransport::new(ONLINE_SYNCS)),
        Arc::new(InMemoryStore::default()),
        None,
    );
    client.on_sync_state(Arc::new(|current: SyncState, previous: SyncState| {
        info!(?previous, ?current, "sync state changed");
    }));

    if let Err(err) = client.start_sync().await {
        error!(code = %err.code, "failed to start sync: {}", err.message);
        std::process::exit(1);
    }
    info!(run_for, "sync loop running against loopback transport");
    tokio::time::sleep(Duration::from_secs(run_for)).await;

    if let Err(err) = client.stop_sync().await {
        error!(code = %err.code, "failed to stop sync: {}", err.message);
        std::process::exit(1);
    }
    println!(
        "Smoke run finished in state {:?} at token {:?}.",
        client.sync_state(),
        client.sync().sync_token()
    );
}
