//! The handle workflow code uses to call activities.
//!
//! Workflow code runs as a replay: every turn re-executes the workflow from
//! the start against the recorded history. An activity call whose result is
//! already in the history resolves immediately; the first call without a
//! result is recorded as the turn's decision and never resolves, which
//! suspends the workflow until the engine runs the activity and starts a new
//! turn.

use crate::codec::{Codec, sealed};
use crate::error::{ActivityError, ActivityFailure};
use crate::snapshot::HistoryEvent;
use crate::task::ActivityOptions;
use bytes::Bytes;
use futures::future::{self, Either};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// An activity call issued by the current turn.
#[derive(Debug, Clone)]
pub struct ScheduledActivity {
    pub seq: u32,
    pub activity: String,
    pub options: ActivityOptions,
    pub input: Bytes,
}

#[derive(Debug, Default)]
pub(crate) struct ReplayState {
    next_seq: u32,
    pub(crate) scheduled: Option<ScheduledActivity>,
    pub(crate) nondeterminism: Option<String>,
}

/// Context passed to workflow code for one turn.
pub struct WorkflowContext<C> {
    workflow_id: Arc<str>,
    codec: Arc<C>,
    history: Arc<[HistoryEvent]>,
    state: Arc<Mutex<ReplayState>>,
}

impl<C> Clone for WorkflowContext<C> {
    fn clone(&self) -> Self {
        Self {
            workflow_id: Arc::clone(&self.workflow_id),
            codec: Arc::clone(&self.codec),
            history: Arc::clone(&self.history),
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: Codec> WorkflowContext<C> {
    /// Context replaying `history` for run `workflow_id`.
    pub fn new(workflow_id: &str, codec: Arc<C>, history: Vec<HistoryEvent>) -> Self {
        Self {
            workflow_id: Arc::from(workflow_id),
            codec,
            history: Arc::from(history),
            state: Arc::new(Mutex::new(ReplayState::default())),
        }
    }

    /// Identifier of the run. Stable across replays.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    pub(crate) fn replay_state(&self) -> Arc<Mutex<ReplayState>> {
        Arc::clone(&self.state)
    }

    /// Call an activity and wait for its result.
    ///
    /// Calls must be awaited one at a time; activities of a run execute
    /// strictly in the order the workflow issues them.
    pub fn execute_activity<I, O>(
        &self,
        activity: &str,
        input: &I,
        options: ActivityOptions,
    ) -> impl Future<Output = Result<O, ActivityFailure>> + Send + 'static
    where
        C: sealed::EncodeValue<I> + sealed::DecodeValue<O>,
        O: Send + 'static,
    {
        match self.resolve(activity, input, options) {
            Some(result) => Either::Left(future::ready(result)),
            None => Either::Right(future::pending()),
        }
    }

    fn resolve<I, O>(
        &self,
        activity: &str,
        input: &I,
        options: ActivityOptions,
    ) -> Option<Result<O, ActivityFailure>>
    where
        C: sealed::EncodeValue<I> + sealed::DecodeValue<O>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_seq += 1;
        let seq = state.next_seq;
        let fail = |error| {
            Some(Err(ActivityFailure {
                activity: activity.to_string(),
                attempts: 0,
                error,
            }))
        };

        let recorded = self.history.iter().find_map(|event| match event {
            HistoryEvent::ActivityScheduled {
                seq: s, activity, ..
            } if *s == seq => Some(activity.as_str()),
            _ => None,
        });

        match recorded {
            Some(recorded) if recorded != activity => {
                let message = format!(
                    "activity call {} is '{}' but the history recorded '{}'",
                    seq, activity, recorded
                );
                state.nondeterminism = Some(message.clone());
                fail(ActivityError::Nondeterministic(message))
            }
            Some(_) => self.history.iter().find_map(|event| match event {
                HistoryEvent::ActivityCompleted { seq: s, output, .. } if *s == seq => Some(
                    self.codec.decode(output).map_err(|e| ActivityFailure {
                        activity: activity.to_string(),
                        attempts: 0,
                        error: ActivityError::Codec(format!("invalid recorded output: {e}")),
                    }),
                ),
                HistoryEvent::ActivityFailed { seq: s, failure } if *s == seq => {
                    Some(Err(failure.clone()))
                }
                _ => None,
            }),
            None if state.scheduled.is_some() => {
                let message = format!(
                    "activity '{}' was called while another activity call was still pending",
                    activity
                );
                state.nondeterminism = Some(message.clone());
                fail(ActivityError::Nondeterministic(message))
            }
            None => match self.codec.encode(input) {
                Ok(input) => {
                    state.scheduled = Some(ScheduledActivity {
                        seq,
                        activity: activity.to_string(),
                        options,
                        input,
                    });
                    None
                }
                Err(e) => fail(ActivityError::Codec(format!("invalid activity input: {e}"))),
            },
        }
    }
}
