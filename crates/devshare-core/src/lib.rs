//! devshare-core: Core types for the devshare device-admission core
//!
//! This crate provides the types shared by every devshare crate:
//! - Device types, units and inventory events
//! - Workload descriptors and device resource names
//! - Normalized requests and allocations
//! - Configuration types
//! - Error handling

pub mod allocation;
pub mod config;
pub mod device;
pub mod error;
pub mod quantity;
pub mod workload;

pub use allocation::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use quantity::*;
pub use workload::*;
