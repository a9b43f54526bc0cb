pub mod api;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod oss;
pub mod upload;

pub use error::{Error, Result};
