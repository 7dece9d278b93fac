//! stackmond: supervises a small, fixed stack of local development services.
//!
//! Services are launched in registry order, probed over HTTP or JSON-RPC,
//! restarted within a bounded budget and torn down in reverse order. All
//! decisions happen on one control loop in [`manager::ServiceManager`].

pub mod config;
pub mod error;
pub mod health;
pub mod ipc;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod state_machine;
pub mod status;
