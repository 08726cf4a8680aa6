//! Structured logging bootstrap.

/// Initialize the global `tracing` subscriber.
///
/// Honors `RUST_LOG` if set; otherwise defaults to `info` for the device
/// crates. Call once, at process startup, before spawning any connection
/// tasks.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "device_server=info,device_session=info,device_handshake=info,device_ota=info,device_events=info".into()
            }),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}
