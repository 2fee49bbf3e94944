//! Proximity unlock library
//! Scans for registered door controllers in the background and unlocks the one in range.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;
pub mod utils;
