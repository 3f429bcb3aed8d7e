//! Tracing setup for the `hd` binary.
//!
//! Diagnostics go to stderr so stdout stays parseable. `HD_LOG` selects the
//! filter (`tracing-subscriber` env-filter syntax); `HD_LOG_FORMAT=json`
//! switches to line-delimited JSON for log shippers.

use tracing_subscriber::EnvFilter;

/// Guard returned by [`init`]; currently nothing to flush, but callers hold
/// it for the life of `main` so a future exporter can hook drop.
pub struct Telemetry;

pub fn init() -> Telemetry {
    let filter = EnvFilter::try_from_env("HD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var("HD_LOG_FORMAT").is_ok_and(|v| v == "json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    // A second init (tests) is fine; keep the first subscriber.
    drop(result);

    Telemetry
}
