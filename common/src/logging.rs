//! Global logger setup.

use log::LevelFilter;

/// Initializes the logger. Repeat calls are no-ops so libraries and tests can
/// both call this safely.
pub fn init_logging() {
    env_logger::Builder::new()
        .filter(None, get_default_log_level())
        .parse_default_env()
        .try_init()
        .ok();
}

fn get_default_log_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}
