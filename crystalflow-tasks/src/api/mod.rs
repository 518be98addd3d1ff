//! HTTP API: start workflows, wait for their results, inspect and cancel
//! them.

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use router::create_router;
pub use state::AppState;
