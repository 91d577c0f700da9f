use std::sync::Arc;

use anyhow::Result;
use facegate_core::{AttemptPolicy, Clock, SystemClock};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod fallback;
mod sessions;
mod store;

use dbus_interface::{AppState, FacegateService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::from_env()?;
    tracing::info!(
        db_path = %config.db_path.display(),
        metric = ?config.metric(),
        descriptor_dim = config.descriptor_dim,
        max_attempts = config.verification.max_attempts,
        "configuration loaded"
    );

    let store = store::FacegateStore::open(&config.db_path, config.descriptor_dim).await?;
    let enrolled = store.count_enrolled().await?;
    tracing::info!(subjects = enrolled, "template store opened");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = Arc::new(AttemptPolicy::from_options(&config.verification, clock.clone()));
    let session_bus = config.session_bus;

    let service = FacegateService {
        state: Arc::new(Mutex::new(AppState {
            pins: fallback::PinVerifier::new(store.clone()),
            store,
            policy,
            clock,
            sessions: sessions::SessionRegistry::new(),
            config,
        })),
    };

    let builder = if session_bus {
        tracing::warn!("using the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus_name = BUS_NAME, object_path = OBJECT_PATH, "facegated ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
