//! Tracing initialization.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "BFA_LOG";
pub const DEFAULT_FILTER: &str = "build_failure_analyzer=info";

static INIT: Once = Once::new();

/// Install the global subscriber, writing to stderr.
///
/// `BFA_LOG` takes per-module directives, e.g.
/// `BFA_LOG=build_failure_analyzer::scan=debug,build_failure_analyzer::kb=warn`.
/// An unset or unparsable value falls back to [`DEFAULT_FILTER`].  Safe to
/// call more than once; a subscriber installed elsewhere is left alone.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true).with_thread_names(true))
            .with(filter)
            .try_init();
    });
}
