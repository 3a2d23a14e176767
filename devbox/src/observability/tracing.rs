//! Tracing subscriber setup and structured state-transition logging.

use crate::reconcile::StateTransition;
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`. With `json` set, lines are
/// emitted as JSON objects. Calling this twice is a no-op.
pub fn init_tracing(default_filter: &str, json: bool) {
    // A subscriber may already be installed by the embedding process or a test.
    let _ = try_init_tracing(default_filter, json);
}

/// Installs the global fmt subscriber, reporting whether it was installed.
pub fn try_init_tracing(
    default_filter: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

/// Logs a service state change at INFO.
pub fn log_transition(transition: &StateTransition) {
    match transition.from {
        Some(from) => ::tracing::info!(
            service = %transition.service,
            from = %from,
            to = %transition.to,
            address = ?transition.address,
            "service state changed"
        ),
        None => ::tracing::info!(
            service = %transition.service,
            to = %transition.to,
            address = ?transition.address,
            "service state observed"
        ),
    }
}
