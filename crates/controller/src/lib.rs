//! meshsplit controller: reconciles TrafficSplits into VirtualServices.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod operator;
pub mod queue;
pub mod reconciler;

pub use config::ControllerConfig;
pub use dispatch::{spawn, DispatchHandle, DispatchStats};
pub use queue::WorkQueue;
pub use reconciler::{Change, ReconcileError, Reconciled, Reconciler};
