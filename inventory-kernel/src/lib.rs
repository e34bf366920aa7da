//! Device inventory synchronizer.
//!
//! Periodically pulls the device list of the mesh-network control plane,
//! validates and enriches it, and reconciles it into a local inventory under
//! a cluster-wide lease so only one reconciliation runs at a time.

pub mod config;
pub mod engine;
pub mod enrich;
pub mod events;
pub mod geo;
pub mod http;
pub mod lock;
pub mod models;
pub mod mqtt;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod upstream;
pub mod validation;
