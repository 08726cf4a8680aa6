//! # device-common
//!
//! Shared configuration, error, identity, and logging primitives used across
//! every device-cloud crate. This is the foundation layer — no protocol
//! logic, just primitives and contracts.

pub mod config;
pub mod device_id;
pub mod error;
pub mod logging;

pub use device_id::DeviceId;
pub use error::{CoreError, CoreResult};
