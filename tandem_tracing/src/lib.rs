//! Profiling spans and log output setup shared by all tandem crates.

pub mod span;

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use span::{EnteredSpan, Span};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,tandem_render=debug";

static INIT: Once = Once::new();

/// Installs the global log subscriber.
///
/// `filter` is used when `RUST_LOG` is not set or invalid. Only the first call has an
/// effect.
pub fn init(filter: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init();

        if let Err(err) = result {
            // Another subscriber was installed outside of this crate. Keep it.
            tracing::debug!("not installing log subscriber: {}", err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::{init, DEFAULT_FILTER};

    #[test]
    fn init_twice() {
        init(DEFAULT_FILTER);
        init("trace");
        tracing::info!("logger installed");
    }
}
