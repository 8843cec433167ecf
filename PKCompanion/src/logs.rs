use pkcconfig::get_config;
use tracing::Level;
use tracing_subscriber::{
    Registry, filter::LevelFilter, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Runtime access to the log filter installed by [`init_logging`].
pub struct LogControl {
    handle: reload::Handle<LevelFilter, Registry>,
}

impl LogControl {
    pub fn level(&self) -> LevelFilter {
        self.handle
            .with_current(|filter| *filter)
            .unwrap_or(LevelFilter::OFF)
    }

    pub fn set_level(&self, level: LevelFilter) {
        if let Err(e) = self.handle.reload(level) {
            eprintln!("Failed to reload log level filter: {}", e);
        }
    }
}

fn string_to_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

/// Installs the global subscriber from the `host.logger` section.
pub fn init_logging() -> LogControl {
    let config = get_config();

    let log_level = match config.get_log_min_level() {
        Ok(l) => match string_to_level(&l) {
            Some(level) => LevelFilter::from_level(level),
            None => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    };
    let (filter, handle) = reload::Layer::new(log_level);
    let subscriber = Registry::default().with(filter);

    let enable_console = config.get_log_enable_console().unwrap_or(true);
    if enable_console {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    } else {
        subscriber.init();
    }

    LogControl { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_level() {
        assert_eq!(string_to_level("debug"), Some(Level::DEBUG));
        assert_eq!(string_to_level(" Warning "), Some(Level::WARN));
        assert_eq!(string_to_level("verbose"), None);
    }
}
