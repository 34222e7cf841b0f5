//! Logger initialization.
//!
//! Log output goes through the `log` facade backed by `env_logger`; every
//! message carries its subsystem prefix ("bus", "update", "network",
//! "main") in the text, written at the call sites.

/// Initializes the logger with the `env_logger` crate.
pub fn init_logger() {
    env_logger::init();
}
