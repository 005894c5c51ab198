//! Server startup utilities.

use conveyor_config::ObservabilityConfig;
use conveyor_dispatcher::Dispatcher;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
fn default_filter(level: &str) -> String {
    format!("info,conveyor={}", level)
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
   ______
  / ____/___  ____ _   _____  __  ______  _____
 / /   / __ \/ __ \ | / / _ \/ / / / __ \/ ___/
/ /___/ /_/ / / / / |/ /  __/ /_/ / /_/ / /
\____/\____/_/ /_/|___/\___/\__, /\____/_/
                           /____/
    "#);
}

/// Prints dispatcher startup information.
pub fn print_startup_info(dispatcher: &Dispatcher) {
    let settings = dispatcher.settings();
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Dispatcher:     {}", dispatcher.uuid());
    info!("Queues:         {:?}", settings.queues);
    info!("Poll interval:  {:?}", settings.poll_interval);
    info!(
        "Heartbeat:      every {:?}, dead after {:?}",
        settings.ping_interval, settings.ping_death_interval
    );
    info!("Callables:      {}", dispatcher.callables().names().join(", "));
    info!("{}", separator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_scopes_level_to_conveyor() {
        assert_eq!(default_filter("debug"), "info,conveyor=debug");
        assert!(EnvFilter::try_new(default_filter("info")).is_ok());
    }

    #[test]
    fn test_print_banner_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_banner();
    }
}
