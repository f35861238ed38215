//! vnet controller library.
//!
//! This crate ships the `vnet-controller` binary, but exposes its building
//! blocks so the CLI and integration tests can drive queues, stores and the
//! reconciliation engine directly.

pub mod carrier;
pub mod cleanup;
pub mod cloud;
pub mod config;
pub mod db;
pub mod engine;
pub mod ipam;
pub mod locks;
pub mod memory;
pub mod model;
pub mod queue;
pub mod store;
pub mod worker;
