//! Device-cloud server binary: boots config/logging, constructs the
//! process-global event bus, and runs the TCP accept loop until terminated.

use std::time::Duration;

use device_events::EventPublisher;
use device_server::DeviceServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = device_common::config::init()?;
    device_common::logging::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting device-server");

    let (events, dispatcher) = EventPublisher::new(Duration::from_secs(config.pubsub.response_timeout_secs));
    let server = DeviceServer::bind(config, events).await?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // `dispatcher` keeps draining queued publishes after the accept loop
    // stops; abort it once we've decided to exit rather than waiting
    // forever, since `EventPublisher` clones are still held by in-flight
    // connection tasks that `ctrl_c` does not wait to drain.
    dispatcher.abort();

    Ok(())
}
