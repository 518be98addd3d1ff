use crate::codec::{Codec, sealed};
use crate::context::{ScheduledActivity, WorkflowContext};
use crate::error::{ActivityError, WorkflowFailure};
use crate::task::BoxFuture;
use bytes::Bytes;
use futures::FutureExt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError};

/// Workflow code operating on encoded payloads.
pub trait CoreWorkflow<C>: Send + Sync {
    fn run(
        &self,
        ctx: WorkflowContext<C>,
        input: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, WorkflowFailure>>;
}

pub type UntypedWorkflow<C> = Arc<dyn CoreWorkflow<C>>;

struct WorkflowFnWrapper<F, I, O> {
    func: Arc<F>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<F, I, O, Fut, C> CoreWorkflow<C> for WorkflowFnWrapper<F, I, O>
where
    F: Fn(WorkflowContext<C>, I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O, WorkflowFailure>> + Send + 'static,
    C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
{
    fn run(
        &self,
        ctx: WorkflowContext<C>,
        input: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, WorkflowFailure>> {
        let func = Arc::clone(&self.func);
        Box::pin(async move {
            let codec = Arc::clone(ctx.codec());
            let input: I = codec.decode(&input).map_err(|e| {
                WorkflowFailure::new(ActivityError::Codec(format!("invalid workflow input: {e}")))
            })?;
            let output = func(ctx, input).await?;
            codec.encode(&output).map_err(|e| {
                WorkflowFailure::new(ActivityError::Codec(format!(
                    "invalid workflow output: {e}"
                )))
            })
        })
    }
}

/// Create a workflow from an async function of a context and a typed input.
pub fn fn_workflow<F, I, O, Fut, C>(func: F) -> UntypedWorkflow<C>
where
    F: Fn(WorkflowContext<C>, I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O, WorkflowFailure>> + Send + 'static,
    C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
{
    Arc::new(WorkflowFnWrapper {
        func: Arc::new(func),
        _phantom: PhantomData,
    })
}

/// What one workflow turn decided.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The workflow returned; carries its encoded output.
    Completed(Bytes),
    /// The workflow returned an error.
    Failed(WorkflowFailure),
    /// The workflow is suspended on a new activity call.
    Scheduled(ScheduledActivity),
    /// The workflow is suspended on an activity already scheduled.
    Waiting,
}

/// Replay the workflow once against the context's history.
///
/// The workflow future is polled a single time. Recorded activity results
/// resolve synchronously, so the poll either finishes the workflow or stops at
/// the first activity call without a result.
pub fn run_turn<C: Codec>(
    workflow: &dyn CoreWorkflow<C>,
    ctx: WorkflowContext<C>,
    input: Bytes,
) -> TurnOutcome {
    let state = ctx.replay_state();
    let result = workflow.run(ctx, input).now_or_never();
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(message) = state.nondeterminism.take() {
        return TurnOutcome::Failed(WorkflowFailure::new(ActivityError::Nondeterministic(
            message,
        )));
    }

    match result {
        Some(Ok(output)) => TurnOutcome::Completed(output),
        Some(Err(failure)) => TurnOutcome::Failed(failure),
        None => match state.scheduled.take() {
            Some(scheduled) => TurnOutcome::Scheduled(scheduled),
            None => TurnOutcome::Waiting,
        },
    }
}
