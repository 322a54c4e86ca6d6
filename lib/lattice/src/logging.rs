pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger. Intended for binaries and manual
/// testing; library components take their logger as a constructor argument.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Error parsing embedded logging config");

    config.build_logger().expect("Error building terminal logger")
}

/// Builds a logger from a TOML config file in the sloggers format.
pub fn from_toml_file<P: AsRef<std::path::Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging config file");

    config.build_logger().expect("Error building configured logger")
}

/// Derives a child logger from the optionally supplied parent. Components
/// accept `impl Into<Option<&Logger>>` and call this so that passing `None`
/// yields a discarding logger.
pub fn component<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
