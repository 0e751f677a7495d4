//! Utility modules for the backup sidecar.

pub mod errors;
pub mod logger;

pub use errors::{
    CaptureError, ConfigError, ControlError, EngineError, NotificationError, QuiesceError,
    StoreError, UploadError,
};

/// Human-readable byte count, e.g. `1.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
