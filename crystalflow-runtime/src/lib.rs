//! Execution side of CrystalFlow.
//!
//! [`PooledWorker`] polls one task queue and executes workflow turns and
//! activity attempts; [`WorkflowClient`] starts runs and observes them. Both
//! talk only to a [`PersistentBackend`](crystalflow_persistence::PersistentBackend),
//! so clients and workers may live in different processes when the backend is
//! shared.

pub mod client;
pub mod worker;

pub use client::{
    ClientError, WorkflowClient, WorkflowDescription, WorkflowHandle, WorkflowOutcome,
    WorkflowStatus,
};
pub use worker::PooledWorker;

pub use crystalflow_core as core;
pub use crystalflow_persistence as persistence;
