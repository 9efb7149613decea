//! Tracing bootstrap for the bot.

use std::env;

use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,room_bot=debug,backend_delivery=debug,backend_matrix=debug";

/// Where the active filter directives came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterSource {
    RustLog,
    BotConfig,
    Default,
}

impl FilterSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::RustLog => "RUST_LOG",
            Self::BotConfig => "ROOM_BOT_LOG",
            Self::Default => "default",
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when it parses; otherwise the filter from [`BotConfig`]
/// applies, falling back to the built-in default.
///
/// [`BotConfig`]: crate::config::BotConfig
pub fn init(configured: Option<&str>) {
    let (env_filter, source) = resolve_filter(env::var("RUST_LOG").ok().as_deref(), configured);
    let installed = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init()
        .is_ok();

    if installed {
        debug!(source = source.as_str(), "logging initialized");
    }
}

fn resolve_filter(rust_log: Option<&str>, configured: Option<&str>) -> (EnvFilter, FilterSource) {
    if let Some(value) = rust_log.filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return (filter, FilterSource::RustLog);
    }

    if let Some(value) = configured
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return (filter, FilterSource::BotConfig);
    }

    (EnvFilter::new(DEFAULT_FILTER), FilterSource::Default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(rust_log: Option<&str>, configured: Option<&str>) -> FilterSource {
        resolve_filter(rust_log, configured).1
    }

    #[test]
    fn rust_log_takes_precedence_over_bot_config() {
        assert_eq!(source(Some("trace"), Some("warn")), FilterSource::RustLog);
    }

    #[test]
    fn bot_config_applies_when_rust_log_is_unset_or_blank() {
        assert_eq!(source(None, Some("warn")), FilterSource::BotConfig);
        assert_eq!(source(Some("  "), Some("warn")), FilterSource::BotConfig);
    }

    #[test]
    fn unparseable_rust_log_falls_through() {
        assert_eq!(source(Some("room_bot=loudest"), None), FilterSource::Default);
        assert_eq!(
            source(Some("room_bot=loudest"), Some("debug")),
            FilterSource::BotConfig
        );
    }

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        assert_eq!(source(None, None), FilterSource::Default);
    }
}
