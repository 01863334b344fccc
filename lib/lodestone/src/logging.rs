pub use slog::{b, debug, error, info, kv, log, o, record, record_static, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a logger from a TOML snippet in the `sloggers` config format.
/// Panics on a malformed config; logger construction happens once at startup.
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(config).expect("malformed logger config");
    config.build_logger().expect("logger construction failed")
}

/// Default stderr terminal logger.
pub fn terminal() -> Logger {
    from_toml(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
}

/// Logger that swallows everything. Used by tests and by construction paths
/// that have no sink wired up yet.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
