//! Fleet operator library.
//!
//! This crate primarily ships a `fleet-operator` binary, but exposes its
//! pieces as a library for integration testing and embedding.

pub mod allocation;
pub mod api;
pub mod config;
pub mod controllers;
pub mod heartbeat;
pub mod metrics;
pub mod model;
pub mod operator;
pub mod state;
pub mod store;
