//! Tracing subscriber setup for the binaries.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the filter directives, e.g. `CASCADE_LOG=cascade_match=debug`.
pub const LOG_ENV: &str = "CASCADE_LOG";

static INIT: Once = Once::new();

/// Installs the global subscriber once; later calls are no-ops.
///
/// Falls back to `info` when [`LOG_ENV`] is unset or invalid. Logs go to
/// stderr so CLI output on stdout stays clean.
pub fn init_tracing(json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    });
}
