use std::env;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber for the SFU process.
///
/// Production output is JSON lines with the current span chain attached, so
/// the structured `room`/`peer`/`session` fields on signaling and fan-out
/// logs survive aggregation. Setting `LOG_FORMAT=pretty` switches to a
/// compact human-readable format for local runs.
pub fn init(rust_log: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(rust_log));
    let registry = tracing_subscriber::registry().with(env_filter);

    let pretty = env::var("LOG_FORMAT").map(|v| v == "pretty").unwrap_or(false);
    if pretty {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .init();
    }
}
