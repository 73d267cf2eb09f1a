use anyhow::Result;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{CaptureService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lensfitd starting");

    let config = config::Config::from_env();
    let engine = engine::build(&config)?;
    let mut changes = engine.session().subscribe();

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, CaptureService::new(engine.clone()))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "lensfitd ready");

    // Forward every snapshot change as a StateChanged signal.
    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    let forwarder = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let state = engine::state_json(&changes.borrow_and_update());
            if let Err(e) = CaptureService::state_changed(&emitter, &state).await {
                tracing::warn!(error = %e, "failed to emit StateChanged");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("lensfitd shutting down");

    forwarder.abort();
    engine.session().stop_camera();

    Ok(())
}
