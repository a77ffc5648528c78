// Tracing subscriber setup

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global fmt subscriber
///
/// `RUST_LOG` wins over `default_level`. Safe to call more than once: a
/// subscriber installed earlier (by a test harness or an embedding process)
/// is kept.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .try_init();

    if result.is_err() {
        tracing::debug!("global tracing subscriber already initialized, keeping it");
    }
}
