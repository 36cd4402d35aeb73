//! Public protocol surface: configuration, errors, constants and core
//! value types shared by the client and indexnode roles.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{ClientConfig, IndexnodeConfig};
pub use error::Fs2Error;
pub use types::{keywords, FileHash, ShareType};
