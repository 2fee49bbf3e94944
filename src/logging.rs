//! Logger setup
//! Lines are stamped with local time. `RUST_LOG` overrides the configured level.

use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::LevelFilter;

/// Installs the global logger. Safe to call more than once; later calls are ignored.
pub fn init(default_level: LevelFilter) {
    let env = Env::default().default_filter_or(default_level.to_string());
    let result = Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:<5}] {}: {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    match result {
        Ok(()) => log::info!("Logging initialized at {}", default_level),
        Err(_) => log::debug!("Logger already initialized"),
    }
}
