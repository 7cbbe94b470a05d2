use tracing_subscriber::filter::targets::Targets;
use tracing_subscriber::prelude::*;

/// Configure logging for a service binary: a JSON fmt layer filtered by
/// RUST_LOG, plus an optional tokio-console layer.
pub fn setup_logging(service_name: &'static str) {
    // Note: This cannot use `EnvFilter` because EnvFilter filters globally
    // even if it is only used in one layer of a tracing stack.
    let filter_layer = {
        let directive = std::env::var("RUST_LOG")
            .ok()
            .unwrap_or_else(|| "info".to_owned());
        directive
            .parse::<Targets>()
            .expect("Failed to parse RUST_LOG")
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(filter_layer);

    let console_layer_opt = std::env::var("TOKIO_CONSOLE_BIND").ok().map(|_| {
        // Enable tokio-console debugging with configuration coming from
        // tokio-console's documented environment variables.
        console_subscriber::ConsoleLayer::builder()
            .with_default_env()
            .spawn()
    });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(console_layer_opt)
        .init();

    log::info!("logging initialized for {service_name}");
}
