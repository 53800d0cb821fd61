//! devshare-api: REST API server for devshare
//!
//! This crate provides the REST API in front of the admission coordinator:
//! - Inventory and workload event ingestion
//! - Workload admission
//! - Node device inspection

pub mod rest;

pub use rest::create_router;
