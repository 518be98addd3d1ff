//! Building blocks of the CrystalFlow workflow engine.
//!
//! Workflows are async functions over a [`WorkflowContext`]; the activities
//! they call are registered by name and routed to task queues. Runs are
//! recorded as [`WorkflowSnapshot`]s and resumed by replaying their history.

pub mod codec;
pub mod context;
pub mod error;
pub mod registry;
pub mod retry;
pub mod serialization;
pub mod snapshot;
pub mod task;
pub mod task_claim;
pub mod task_queue;
pub mod workflow;

pub use context::WorkflowContext;
pub use error::{ActivityError, ActivityFailure, WorkflowError, WorkflowFailure};
pub use registry::{ActivityRegistry, WorkflowRegistry};
pub use retry::RetryPolicy;
pub use serialization::JsonCodec;
pub use snapshot::WorkflowSnapshot;
pub use task::ActivityOptions;
pub use task_queue::{Capabilities, TaskQueue, TaskQueueRegistry};
