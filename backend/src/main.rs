//! Worker entry-point: connects the event bus and runs the image cleanup
//! consumer until SIGINT or SIGTERM.

use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use ortho_config::OrthoConfig;
use tracing::error;

use bookworm_events::domain::{BOOK_DELETED, EventBus, ImageCleanupHandler, RoutingPattern};
use bookworm_events::outbound::broker::LapinBroker;
use bookworm_events::outbound::images::LoggingImageStore;
use bookworm_events::{EventBusSettings, telemetry, worker};

/// Application bootstrap.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    telemetry::init();

    let settings = EventBusSettings::load().wrap_err("loading event bus settings")?;
    let pattern = RoutingPattern::new(BOOK_DELETED)?;
    let bus = EventBus::new(
        Arc::new(LapinBroker::new(settings.url())),
        settings.bus_config(),
    );

    // A failed first connect leaves the bus reconnecting in the background.
    if let Err(e) = bus.start().await {
        error!(error = %e, "initial broker connection failed");
    }

    let handler = ImageCleanupHandler::new(Arc::new(LoggingImageStore::new()));
    worker::run_until(
        &bus,
        pattern,
        handler,
        settings.reconnect_policy().base_delay,
        shutdown_signal(),
    )
    .await
    .wrap_err("waiting for shutdown signal")
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
