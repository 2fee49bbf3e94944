//! Core functionality for proximity unlock
//! Bluetooth session handling and device persistence.

pub mod bluetooth;
pub mod store;

// Re-export commonly used types
pub use bluetooth::{ScannerHandle, UnlockManager};
pub use store::JsonDeviceStore;
