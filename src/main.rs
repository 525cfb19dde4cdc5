//! sovid - Device Orchestration Daemon
//!
//! Starts the scheduler and the dashboard API.

use std::sync::Arc;

use sovi::api::{self, AppState};
use sovi::crypto::Codec;
use sovi::events::EventLog;
use sovi::scheduler::Scheduler;
use sovi::store::Store;
use sovi::Config;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sovi=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Startup failures (missing key, unreachable store) exit non-zero.
    let config = Config::from_env()?;
    let codec = Codec::from_env()?;
    info!("master key loaded; credential codec ready");

    let store = Store::open(&config.database_path)?;
    info!("store open at {}", config.database_path.display());

    let events = EventLog::new(store.clone());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        events.clone(),
        codec,
        config.clone(),
    ));

    // An empty fleet is a warning, not a startup failure.
    match scheduler.start().await {
        Ok(0) => info!("scheduler idle: no active devices"),
        Ok(n) => info!("scheduler running with {} device worker(s)", n),
        Err(e) => return Err(e.into()),
    }

    let state = Arc::new(AppState {
        config,
        store,
        events,
        scheduler,
    });
    api::serve(state).await?;

    info!("clean shutdown");
    Ok(())
}
