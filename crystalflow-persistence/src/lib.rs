//! Persistence layer for CrystalFlow workflow runs.
//!
//! The [`PersistentBackend`] trait stores run snapshots, the per-queue task
//! FIFOs workers poll, the claims that give a worker exclusive use of a
//! task, and cancellation requests. [`InMemoryBackend`] is the reference
//! implementation used by a single-process deployment and by tests.
//!
//! # Implementing Custom Backends
//!
//! A durable backend (Redis, PostgreSQL, ...) implements the trait and must
//! make `claim_task` atomic: two workers racing for the same task must not
//! both receive a claim.
//!
//! ```rust,ignore
//! use crystalflow_persistence::{BackendError, PersistentBackend};
//! use crystalflow_core::snapshot::WorkflowSnapshot;
//! use async_trait::async_trait;
//!
//! pub struct RedisBackend {
//!     // your Redis client
//! }
//!
//! #[async_trait]
//! impl PersistentBackend for RedisBackend {
//!     async fn save_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), BackendError> {
//!         // serialize and save to Redis
//!     }
//!     // ... implement other methods
//! }
//! ```

mod backend;
mod in_memory;

pub use backend::{BackendError, PersistentBackend};
pub use in_memory::InMemoryBackend;
