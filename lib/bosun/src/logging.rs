//! Root logger construction and the logging facade used by every crate in
//! the workspace. Components never build their own loggers; they receive one
//! and derive children with `log.new(o!(...))`.

use sloggers::{Config, LoggerConfig};
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Logger configuration used when no config file is present next to the
/// binary: human-readable terminal output on stderr.
const DEFAULT_LOG_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger from a `sloggers` TOML config file, falling back
/// to the built-in terminal config when the file is absent.
pub fn init<P: AsRef<Path>>(config_path: P) -> Logger {
    let path = config_path.as_ref();

    let config: LoggerConfig = if path.is_file() {
        serdeconv::from_toml_file(path).expect("Error loading logging configuration file")
    } else {
        serdeconv::from_toml_str(DEFAULT_LOG_CONFIG).expect("Default logging configuration is invalid")
    };

    config.build_logger().expect("Failed building the root logger")
}
