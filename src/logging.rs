//! Structured logging bootstrap.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Variable holding the `tracing` filter directives.
pub const LOG_ENV: &str = "CHAT_ENGINE_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// Install the global fmt subscriber. Later calls are no-ops.
pub fn init_logging() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
        // Another subscriber may already be installed by the host.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::init_logging;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_logging();
        init_logging();
        tracing::info!("logging initialised twice");
    }
}
