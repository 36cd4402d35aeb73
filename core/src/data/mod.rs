//! Persistence helpers: atomic sibling-rename writes, the debounced
//! saver, and per-volume refresh permits.

pub mod saver;
pub mod volumes;

pub use saver::{save_atomic, working_path, SafeSaver};
pub use volumes::VolumePools;

use std::path::PathBuf;

/// The directory persisted client state lives in when none is configured.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fs2")
}
