//! Tracing subscriber setup for controller processes.
//!
//! `RUST_LOG` takes precedence over the configured level when set.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber at `level`.
///
/// Only the first call in a process installs anything; later calls are ignored.
pub fn init(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Parse a level name such as `"info"`, falling back to `INFO`.
pub fn parse_level(name: &str) -> Level {
    name.parse().unwrap_or(Level::INFO)
}

/// Shift `base` by `-v` / `-q` counts: each `-v` is one level more verbose,
/// each `-q` one level quieter.
pub fn level_from_verbosity(base: Level, verbose: u8, quiet: u8) -> Level {
    const LEVELS: [Level; 5] = [
        Level::ERROR,
        Level::WARN,
        Level::INFO,
        Level::DEBUG,
        Level::TRACE,
    ];
    let start = LEVELS.iter().position(|l| *l == base).unwrap_or(2) as i32;
    let shifted = (start + i32::from(verbose) - i32::from(quiet)).clamp(0, 4);
    LEVELS[shifted as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity() {
        assert_eq!(level_from_verbosity(Level::INFO, 0, 0), Level::INFO);
        assert_eq!(level_from_verbosity(Level::INFO, 1, 0), Level::DEBUG);
        assert_eq!(level_from_verbosity(Level::INFO, 5, 0), Level::TRACE);
        assert_eq!(level_from_verbosity(Level::INFO, 0, 2), Level::ERROR);
        assert_eq!(level_from_verbosity(Level::WARN, 1, 1), Level::WARN);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(Level::INFO);
        init(Level::DEBUG);
    }
}
