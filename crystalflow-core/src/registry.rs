//! Name-to-implementation registries for activities and workflows.
//!
//! Only names travel through queues and histories; workers look the
//! implementations up here. Every process that executes work builds its
//! registries from the same code.
//!
//! ```rust
//! use crystalflow_core::error::ActivityError;
//! use crystalflow_core::registry::ActivityRegistry;
//! use crystalflow_core::serialization::JsonCodec;
//! use std::sync::Arc;
//!
//! let registry = ActivityRegistry::with_codec(Arc::new(JsonCodec))
//!     .register_fn("double", |i: u32| async move { Ok::<_, ActivityError>(i * 2) })
//!     .register_fn("add_ten", |i: u32| async move { Ok::<_, ActivityError>(i + 10) })
//!     .build()
//!     .unwrap();
//! assert!(registry.contains("double"));
//! ```

use crate::codec::{Codec, sealed};
use crate::context::WorkflowContext;
use crate::error::{ActivityError, WorkflowError, WorkflowFailure};
use crate::task::{UntypedActivity, fn_activity};
use crate::workflow::{UntypedWorkflow, fn_workflow};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Registry of activity implementations.
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    activities: HashMap<String, UntypedActivity>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity under `name`.
    ///
    /// Fails if the name is already taken.
    pub fn register(&mut self, name: &str, activity: UntypedActivity) -> Result<(), WorkflowError> {
        if self.activities.contains_key(name) {
            return Err(WorkflowError::DuplicateRegistration(name.to_string()));
        }
        self.activities.insert(name.to_string(), activity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<UntypedActivity> {
        self.activities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(|s| s.as_str())
    }

    /// Start a builder that wraps typed closures with `codec`.
    pub fn with_codec<C: Codec>(codec: Arc<C>) -> ActivityRegistryBuilder<C> {
        ActivityRegistryBuilder {
            codec,
            registry: ActivityRegistry::new(),
            error: None,
        }
    }
}

/// Builder created by [`ActivityRegistry::with_codec`].
///
/// Registration errors are deferred to [`build`](Self::build) so calls can be
/// chained.
pub struct ActivityRegistryBuilder<C> {
    codec: Arc<C>,
    registry: ActivityRegistry,
    error: Option<WorkflowError>,
}

impl<C: Codec> ActivityRegistryBuilder<C> {
    /// Register an already type-erased activity.
    pub fn register(mut self, name: &str, activity: UntypedActivity) -> Self {
        if self.error.is_none() {
            self.error = self.registry.register(name, activity).err();
        }
        self
    }

    /// Register a typed async function.
    pub fn register_fn<I, O, F, Fut>(self, name: &str, func: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        I: Send + 'static,
        O: Send + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
        C: sealed::DecodeValue<I> + sealed::EncodeValue<O>,
    {
        let activity = fn_activity(Arc::clone(&self.codec), func);
        self.register(name, activity)
    }

    pub fn build(self) -> Result<ActivityRegistry, WorkflowError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.registry),
        }
    }
}

/// Registry of workflow implementations, keyed by workflow type.
pub struct WorkflowRegistry<C> {
    workflows: HashMap<String, UntypedWorkflow<C>>,
}

impl<C> Default for WorkflowRegistry<C> {
    fn default() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }
}

impl<C> Clone for WorkflowRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            workflows: self.workflows.clone(),
        }
    }
}

impl<C: Codec> WorkflowRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        workflow_type: &str,
        workflow: UntypedWorkflow<C>,
    ) -> Result<(), WorkflowError> {
        if self.workflows.contains_key(workflow_type) {
            return Err(WorkflowError::DuplicateRegistration(
                workflow_type.to_string(),
            ));
        }
        self.workflows.insert(workflow_type.to_string(), workflow);
        Ok(())
    }

    /// Register a typed async workflow function.
    pub fn register_fn<I, O, F, Fut>(
        &mut self,
        workflow_type: &str,
        func: F,
    ) -> Result<(), WorkflowError>
    where
        F: Fn(WorkflowContext<C>, I) -> Fut + Send + Sync + 'static,
        I: Send + 'static,
        O: Send + 'static,
        Fut: Future<Output = Result<O, WorkflowFailure>> + Send + 'static,
        C: sealed::DecodeValue<I> + sealed::EncodeValue<O>,
    {
        self.register(workflow_type, fn_workflow(func))
    }

    pub fn get(&self, workflow_type: &str) -> Option<UntypedWorkflow<C>> {
        self.workflows.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::JsonCodec;
    use crate::task::ActivityOptions;

    #[test]
    fn builder_collects_activities() {
        let registry = ActivityRegistry::with_codec(Arc::new(JsonCodec))
            .register_fn("double", |i: u32| async move { Ok::<_, ActivityError>(i * 2) })
            .register_fn("echo", |s: String| async move { Ok::<_, ActivityError>(s) })
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("double").is_some());
        assert!(registry.get("missing").is_none());
        let mut names: Vec<_> = registry.names().collect();
        names.sort();
        assert_eq!(names, vec!["double", "echo"]);
    }

    #[test]
    fn duplicate_activity_name_is_rejected() {
        let result = ActivityRegistry::with_codec(Arc::new(JsonCodec))
            .register_fn("double", |i: u32| async move { Ok::<_, ActivityError>(i * 2) })
            .register_fn("double", |i: u32| async move { Ok::<_, ActivityError>(i * 3) })
            .build();

        assert!(matches!(
            result,
            Err(WorkflowError::DuplicateRegistration(name)) if name == "double"
        ));
    }

    #[test]
    fn workflows_register_once() {
        let mut registry = WorkflowRegistry::<JsonCodec>::new();
        registry
            .register_fn("echo", |ctx: WorkflowContext<JsonCodec>, s: String| async move {
                let out: String = ctx
                    .execute_activity("echo", &s, ActivityOptions::default())
                    .await?;
                Ok::<_, WorkflowFailure>(out)
            })
            .unwrap();

        assert!(registry.contains("echo"));
        let duplicate = registry.register_fn(
            "echo",
            |_: WorkflowContext<JsonCodec>, s: String| async move {
                Ok::<_, WorkflowFailure>(s)
            },
        );
        assert!(duplicate.is_err());
    }
}
