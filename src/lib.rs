//! tether: an RPC runtime with a sandbox execution bridge
//!
//! The runtime and the bridge live in the `tether-rpc` and `tether-sandbox`
//! workspace crates. This crate holds what the `tether` binary shares:
//! logging setup, configuration and the built-in procedures.

pub mod config;
pub mod procedures;

pub use config::{ConfigError, TetherConfig};

/// Initialise logging at `level` (Info when `None`). `RUST_LOG` still
/// overrides it. Calling twice is harmless.
pub fn setup(level: Option<log::LevelFilter>) {
    let result = env_logger::Builder::new()
        .filter_level(level.unwrap_or(log::LevelFilter::Info))
        .parse_default_env()
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialised");
    }
}
