// Tracing subscriber setup for processes embedding the client.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::settings::Settings;

/// Installs a global subscriber filtered at `settings.log_level` (`RUST_LOG` wins when set).
/// Returns false when another subscriber was already installed, which is left in place.
pub fn init_tracing(settings: &Settings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_lowercase()));

    let layer = if settings.structured_logging {
        fmt::layer()
            .with_target(true)
            .json()
            .with_current_span(true)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter).boxed()
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => {
            tracing::info!(
                level = %settings.log_level,
                structured = settings.structured_logging,
                "tracing initialized"
            );
            true
        }
        Err(_) => {
            tracing::debug!("global tracing subscriber already installed, keeping it");
            false
        }
    }
}
