//! Lifecycle of a long-running consumer process.

use std::future::Future;
use std::io;
use std::time::Duration;

use tracing::{error, info};

use crate::domain::ports::EventHandler;
use crate::domain::{EventBus, RoutingPattern};

/// Consume `pattern` with `handler` until `shutdown` resolves.
///
/// Subscription failures are retried every `retry_delay`. Whatever
/// `shutdown` yields, the subscription is cancelled and the bus is shut down
/// before its result is returned.
pub async fn run_until<H, S>(
    bus: &EventBus,
    pattern: RoutingPattern,
    handler: H,
    retry_delay: Duration,
    shutdown: S,
) -> io::Result<()>
where
    H: EventHandler + Clone + 'static,
    S: Future<Output = io::Result<()>>,
{
    tokio::pin!(shutdown);
    let mut subscription = None;
    let signal = loop {
        match bus.subscribe(pattern.clone(), handler.clone()).await {
            Ok(handle) => {
                subscription = Some(handle);
                break (&mut shutdown).await;
            }
            Err(e) => {
                error!(error = %e, pattern = %pattern, "subscribing failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(retry_delay) => {}
                    signal = &mut shutdown => break signal,
                }
            }
        }
    };
    match &signal {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!(error = %e, "waiting for shutdown signal failed, stopping"),
    }

    if let Some(handle) = subscription {
        handle.cancel().await;
    }
    if let Err(e) = bus.shutdown().await {
        error!(error = %e, "closing broker connection failed");
    }
    info!("event worker stopped");
    signal
}
