use crate::codec::{Codec, sealed};
use crate::error::ActivityError;
use crate::retry::RetryPolicy;
use crate::task_queue::TaskQueue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An activity the runtime can execute on encoded payloads.
///
/// Implementations decode their input, do the work and encode their output.
/// The runtime never sees the typed values.
pub trait CoreActivity: Send + Sync {
    fn run(&self, input: Bytes) -> BoxFuture<'static, Result<Bytes, ActivityError>>;
}

/// Type-erased, shareable activity.
pub type UntypedActivity = Arc<dyn CoreActivity>;

/// Per-call execution options, declared by the workflow at each call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Deadline for one attempt, from start to completion.
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Queue override. `None` keeps the activity on the workflow's queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<TaskQueue>,
}

impl ActivityOptions {
    pub fn with_timeout(start_to_close_timeout: Duration) -> Self {
        Self {
            start_to_close_timeout,
            retry_policy: RetryPolicy::default(),
            task_queue: None,
        }
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn on_queue(mut self, queue: TaskQueue) -> Self {
        self.task_queue = Some(queue);
        self
    }
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(60))
    }
}

/// Wraps a typed async function as a [`CoreActivity`].
struct ActivityFnWrapper<F, I, O, C> {
    func: Arc<F>,
    codec: Arc<C>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<F, I, O, Fut, C> CoreActivity for ActivityFnWrapper<F, I, O, C>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
{
    fn run(&self, input: Bytes) -> BoxFuture<'static, Result<Bytes, ActivityError>> {
        let func = Arc::clone(&self.func);
        let codec = Arc::clone(&self.codec);
        Box::pin(async move {
            let input: I = codec
                .decode(&input)
                .map_err(|e| ActivityError::Codec(format!("invalid activity input: {e}")))?;
            let output = func(input).await?;
            codec
                .encode(&output)
                .map_err(|e| ActivityError::Codec(format!("invalid activity output: {e}")))
        })
    }
}

/// Create an activity from any async function returning
/// `Result<O, ActivityError>`.
///
/// # Example
/// ```
/// use crystalflow_core::error::ActivityError;
/// use crystalflow_core::serialization::JsonCodec;
/// use crystalflow_core::task::fn_activity;
/// use std::sync::Arc;
///
/// let _activity = fn_activity(Arc::new(JsonCodec), |name: String| async move {
///     if name.is_empty() {
///         return Err(ActivityError::Validation("molecule name is empty".into()));
///     }
///     Ok(format!("molecule name: {name}"))
/// });
/// ```
pub fn fn_activity<F, I, O, Fut, C>(codec: Arc<C>, func: F) -> UntypedActivity
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
{
    Arc::new(ActivityFnWrapper {
        func: Arc::new(func),
        codec,
        _phantom: PhantomData,
    })
}
