//! Diagnostic logging setup.
//!
//! Diagnostics go to stderr so command output on stdout stays parseable. The
//! audit log is separate and unaffected by the filter.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the filter directive, e.g. `PMS_LOG=pms=debug`.
pub const LOG_ENV: &str = "PMS_LOG";
const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber. Safe to call more than once.
pub fn init() {
    init_with(None);
}

/// Like [`init`], with an explicit directive taking precedence over `PMS_LOG`.
pub fn init_with(directive: Option<&str>) {
    let filter = match directive {
        Some(d) => EnvFilter::new(d),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()),
    };
    // Fails only when a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
