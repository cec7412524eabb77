//! Process-wide logging setup.
//!
//! env_logger does the formatting; the effective verbosity is a numeric
//! debug level that can be changed at runtime through `log::set_max_level`.

use crate::config::types::{io_context, Result, XprocError};
use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::Path;

/// Map a numeric debug level onto a log filter.
pub fn level_for(debug: i32) -> LevelFilter {
    match debug {
        i32::MIN..=-1 => LevelFilter::Error,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Inverse of [`level_for`] for the currently active filter.
pub fn current_debug_level() -> i32 {
    match log::max_level() {
        LevelFilter::Off | LevelFilter::Error | LevelFilter::Warn => -1,
        LevelFilter::Info => 0,
        LevelFilter::Debug => 1,
        LevelFilter::Trace => 2,
    }
}

/// Change verbosity for the rest of the process lifetime.
pub fn set_debug_level(debug: i32) {
    let level = level_for(debug);
    log::set_max_level(level);
    log::info!("debug level set to {} ({})", debug, level);
}

/// Install the global logger, writing to `log_file` (appended) or stderr.
///
/// `RUST_LOG` still narrows output per module; the debug level caps it.
pub fn init_logging(debug: i32, log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .format_timestamp_millis();

    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_context(format!("open log file {}", path.display()), e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| XprocError::Config(format!("logger already installed: {}", e)))?;
    log::set_max_level(level_for(debug));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_levels_map_to_filters() {
        assert_eq!(level_for(-3), LevelFilter::Error);
        assert_eq!(level_for(0), LevelFilter::Info);
        assert_eq!(level_for(1), LevelFilter::Debug);
        assert_eq!(level_for(7), LevelFilter::Trace);
    }
}
