//! Reconciliation controllers.
//!
//! Change notifications from the store are turned into object keys by the
//! [`dispatch::Dispatcher`] and queued per controller. Every controller
//! re-fetches its object by key and converges it; nothing is shared between
//! passes except the port registry, the allocation queue, and the
//! expectation sets each controller owns.

pub mod build;
pub mod dispatch;
pub mod instance;
pub mod node;
pub mod worker;

use fleet_networking::PortError;
use fleet_reconcile::ReconcileError;
use thiserror::Error;

use crate::store::StoreError;

pub use build::FleetScaler;
pub use dispatch::{Dispatcher, Queues};
pub use instance::InstanceLifecycleController;
pub use node::NodeReconciler;
pub use worker::{Action, Controller, ControllerConfig, Reconciler, WorkQueue};

/// Controller errors. None of these are fatal; the key is retried.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("port registry error: {0}")]
    Ports(#[from] PortError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
