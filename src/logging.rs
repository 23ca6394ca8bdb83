//! Tracing subscriber setup.
//!
//! `RUST_LOG`, when set, wins over the configured level. Calling [`init`]
//! more than once is harmless: only the first subscriber is installed.

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber for `app`.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(app: &ApplicationConfig) -> bool {
    let filter = filter_for(&app.log_level);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if app.json_logs {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    if installed {
        tracing::info!(app = %app.name, level = %app.log_level, json = app.json_logs, "Logging initialized");
    }
    installed
}

/// `RUST_LOG` if present and valid, else `level` for this crate and `warn`
/// for everything else.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,rust_gpib={level}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let app = ApplicationConfig {
            name: "test".to_string(),
            log_level: "debug".to_string(),
            json_logs: false,
        };
        let first = init(&app);
        // a second call never panics and never replaces the first subscriber
        assert!(!init(&app) || !first);
    }

    #[test]
    fn test_filter_mentions_crate() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(filter_for("trace").to_string().contains("rust_gpib=trace"));
        }
    }
}
