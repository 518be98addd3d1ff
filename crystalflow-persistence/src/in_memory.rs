//! In-memory implementation of PersistentBackend.
//!
//! Everything lives in process memory and is shared through `Arc`s, so one
//! backend value can be cloned into the client and all worker pools of a
//! process.

use crate::backend::{BackendError, PersistentBackend};
use async_trait::async_trait;
use chrono::Duration;
use crystalflow_core::snapshot::WorkflowSnapshot;
use crystalflow_core::task_claim::{AvailableTask, TaskClaim};
use crystalflow_core::task_queue::{Capabilities, TaskQueue};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Thread-safe in-memory backend.
#[derive(Clone)]
pub struct InMemoryBackend {
    snapshots: Arc<RwLock<HashMap<String, WorkflowSnapshot>>>,
    queues: Arc<RwLock<HashMap<TaskQueue, VecDeque<AvailableTask>>>>,
    claims: Arc<RwLock<HashMap<String, TaskClaim>>>, // Key: "{instance_id}:{task_id}"
    cancellations: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            claims: Arc::new(RwLock::new(HashMap::new())),
            cancellations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn claim_key(instance_id: &str, task_id: &str) -> String {
        format!("{}:{}", instance_id, task_id)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentBackend for InMemoryBackend {
    async fn create_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), BackendError> {
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        if snapshots.contains_key(&snapshot.instance_id) {
            return Err(BackendError::AlreadyExists(snapshot.instance_id));
        }
        snapshots.insert(snapshot.instance_id.clone(), snapshot);
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: WorkflowSnapshot) -> Result<(), BackendError> {
        let instance_id = snapshot.instance_id.clone();
        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        snapshots.insert(instance_id, snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, instance_id: &str) -> Result<WorkflowSnapshot, BackendError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        snapshots
            .get(instance_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(instance_id.to_string()))
    }

    async fn enqueue_task(&self, task: AvailableTask) -> Result<(), BackendError> {
        let mut queues = self
            .queues
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        queues.entry(task.task_queue).or_default().push_back(task);
        Ok(())
    }

    async fn find_available_tasks(
        &self,
        queue: TaskQueue,
        capabilities: &Capabilities,
        limit: usize,
    ) -> Result<Vec<AvailableTask>, BackendError> {
        // Clean up expired claims first
        {
            let mut claims = self
                .claims
                .write()
                .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
            claims.retain(|_, claim| !claim.is_expired());
        }

        let queues = self
            .queues
            .read()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        let claims = self
            .claims
            .read()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;

        let Some(tasks) = queues.get(&queue) else {
            return Ok(Vec::new());
        };

        Ok(tasks
            .iter()
            .filter(|task| task.is_due())
            .filter(|task| task.kind.is_accepted_by(capabilities))
            .filter(|task| !claims.contains_key(&Self::claim_key(&task.instance_id, &task.task_id)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_task(
        &self,
        instance_id: &str,
        task_id: &str,
        worker_id: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<TaskClaim>, BackendError> {
        let key = Self::claim_key(instance_id, task_id);
        let queues = self
            .queues
            .read()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        let mut claims = self
            .claims
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;

        // Completed tasks leave the queue; a late claim must not revive them.
        let queued = queues
            .values()
            .flatten()
            .any(|task| task.instance_id == instance_id && task.task_id == task_id);
        if !queued {
            return Ok(None);
        }

        if let Some(existing_claim) = claims.get(&key) {
            if !existing_claim.is_expired() {
                return Ok(None);
            }
            claims.remove(&key);
        }

        let claim = TaskClaim::new(
            instance_id.to_string(),
            task_id.to_string(),
            worker_id.to_string(),
            ttl,
        );
        claims.insert(key, claim.clone());
        Ok(Some(claim))
    }

    async fn release_task_claim(
        &self,
        instance_id: &str,
        task_id: &str,
        worker_id: &str,
    ) -> Result<(), BackendError> {
        let key = Self::claim_key(instance_id, task_id);
        let mut claims = self
            .claims
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;

        match claims.get(&key) {
            Some(claim) if !claim.is_owned_by(worker_id) => Err(BackendError::Backend(format!(
                "Claim owned by different worker: {}",
                claim.worker_id
            ))),
            Some(_) => {
                claims.remove(&key);
                Ok(())
            }
            None => Err(BackendError::NotFound(key)),
        }
    }

    async fn extend_task_claim(
        &self,
        instance_id: &str,
        task_id: &str,
        worker_id: &str,
        additional_duration: Duration,
    ) -> Result<(), BackendError> {
        let key = Self::claim_key(instance_id, task_id);
        let mut claims = self
            .claims
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;

        let Some(claim) = claims.get_mut(&key) else {
            return Err(BackendError::NotFound(key));
        };
        if !claim.is_owned_by(worker_id) {
            return Err(BackendError::Backend(format!(
                "Claim owned by different worker: {}",
                claim.worker_id
            )));
        }
        if let Some(expires_at) = claim.expires_at {
            let new_expiry = expires_at
                .checked_add_signed(additional_duration)
                .ok_or_else(|| BackendError::Backend("Time overflow".to_string()))?;
            claim.expires_at = Some(new_expiry);
        }
        Ok(())
    }

    async fn complete_task(&self, instance_id: &str, task_id: &str) -> Result<(), BackendError> {
        {
            let mut queues = self
                .queues
                .write()
                .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
            for queue in queues.values_mut() {
                queue.retain(|task| !(task.instance_id == instance_id && task.task_id == task_id));
            }
        }
        let mut claims = self
            .claims
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        claims.remove(&Self::claim_key(instance_id, task_id));
        Ok(())
    }

    async fn request_cancellation(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), BackendError> {
        {
            let snapshots = self
                .snapshots
                .read()
                .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
            if !snapshots.contains_key(instance_id) {
                return Err(BackendError::NotFound(instance_id.to_string()));
            }
        }
        let mut cancellations = self
            .cancellations
            .write()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        cancellations
            .entry(instance_id.to_string())
            .or_insert_with(|| reason.to_string());
        Ok(())
    }

    async fn cancellation_reason(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, BackendError> {
        let cancellations = self
            .cancellations
            .read()
            .map_err(|e| BackendError::Backend(format!("Lock error: {}", e)))?;
        Ok(cancellations.get(instance_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn snapshot(id: &str) -> WorkflowSnapshot {
        WorkflowSnapshot::new(id, "pubchem", TaskQueue::Cpu, Bytes::from_static(b"\"caffeine\""))
    }

    async fn backend_with_task() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend
            .enqueue_task(AvailableTask::workflow(
                "workflow-1",
                "task-1",
                TaskQueue::Cpu,
                "pubchem",
                Bytes::new(),
            ))
            .await
            .unwrap();
        backend
    }

    fn lookup_capabilities() -> Capabilities {
        Capabilities {
            workflows: ["pubchem".to_string()].into(),
            activities: ["run_lookup_query".to_string()].into(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let backend = InMemoryBackend::new();
        backend.save_snapshot(snapshot("test-123")).await.unwrap();

        let loaded = backend.load_snapshot("test-123").await.unwrap();
        assert_eq!(loaded.instance_id, "test-123");
        assert_eq!(loaded.workflow_type, "pubchem");
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let backend = InMemoryBackend::new();
        backend.create_snapshot(snapshot("test-123")).await.unwrap();

        let result = backend.create_snapshot(snapshot("test-123")).await;
        assert!(matches!(result, Err(BackendError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_not_found() {
        let backend = InMemoryBackend::new();
        let result = backend.load_snapshot("nonexistent").await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_queues_are_isolated_and_fifo() {
        let backend = InMemoryBackend::new();
        for id in ["run-1", "run-2"] {
            backend
                .enqueue_task(AvailableTask::workflow(
                    id,
                    "workflow-0",
                    TaskQueue::Cpu,
                    "pubchem",
                    Bytes::new(),
                ))
                .await
                .unwrap();
        }

        let tasks = backend
            .find_available_tasks(TaskQueue::Cpu, &lookup_capabilities(), 10)
            .await
            .unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["run-1", "run-2"]);

        let gpu = backend
            .find_available_tasks(TaskQueue::Gpu, &lookup_capabilities(), 10)
            .await
            .unwrap();
        assert!(gpu.is_empty());
    }

    #[tokio::test]
    async fn test_find_skips_claimed_delayed_and_unsupported_tasks() {
        let backend = InMemoryBackend::new();
        let claimed = AvailableTask::activity("run-1", TaskQueue::Cpu, 1, "run_lookup_query", 1, Bytes::new());
        let delayed = AvailableTask::activity("run-2", TaskQueue::Cpu, 1, "run_lookup_query", 2, Bytes::new())
            .not_before(chrono::Utc::now() + Duration::seconds(60));
        let unsupported = AvailableTask::activity("run-3", TaskQueue::Cpu, 1, "run_inference", 1, Bytes::new());
        let ready = AvailableTask::activity("run-4", TaskQueue::Cpu, 1, "run_lookup_query", 1, Bytes::new());
        for task in [claimed.clone(), delayed, unsupported, ready] {
            backend.enqueue_task(task).await.unwrap();
        }
        backend
            .claim_task(&claimed.instance_id, &claimed.task_id, "worker-1", None)
            .await
            .unwrap();

        let tasks = backend
            .find_available_tasks(TaskQueue::Cpu, &lookup_capabilities(), 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].instance_id, "run-4");
    }

    #[tokio::test]
    async fn test_find_respects_limit() {
        let backend = InMemoryBackend::new();
        for seq in 1..=5 {
            backend
                .enqueue_task(AvailableTask::activity(
                    format!("run-{seq}"),
                    TaskQueue::Cpu,
                    1,
                    "run_lookup_query",
                    1,
                    Bytes::new(),
                ))
                .await
                .unwrap();
        }
        let tasks = backend
            .find_available_tasks(TaskQueue::Cpu, &lookup_capabilities(), 2)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_task_removes_task_and_claim() {
        let backend = InMemoryBackend::new();
        let task = AvailableTask::activity("run-1", TaskQueue::Cpu, 1, "run_lookup_query", 1, Bytes::new());
        backend.enqueue_task(task.clone()).await.unwrap();
        backend
            .claim_task("run-1", &task.task_id, "worker-1", None)
            .await
            .unwrap();

        backend.complete_task("run-1", &task.task_id).await.unwrap();

        assert!(
            backend
                .claim_task("run-1", &task.task_id, "worker-2", None)
                .await
                .unwrap()
                .is_none()
        );
        let result = backend
            .release_task_claim("run-1", &task.task_id, "worker-1")
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_claim_task_success() {
        let backend = backend_with_task().await;

        let claim = backend
            .claim_task("workflow-1", "task-1", "worker-1", Some(Duration::seconds(300)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.instance_id, "workflow-1");
        assert_eq!(claim.task_id, "task-1");
        assert_eq!(claim.worker_id, "worker-1");
        assert!(claim.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_completed_task_cannot_be_claimed() {
        let backend = backend_with_task().await;
        backend.complete_task("workflow-1", "task-1").await.unwrap();

        let claim = backend
            .claim_task("workflow-1", "task-1", "worker-2", None)
            .await
            .unwrap();
        assert!(claim.is_none());
    }

    #[tokio::test]
    async fn test_claim_task_already_claimed() {
        let backend = backend_with_task().await;

        let claim1 = backend
            .claim_task("workflow-1", "task-1", "worker-1", Some(Duration::seconds(300)))
            .await
            .unwrap();
        assert!(claim1.is_some());

        let claim2 = backend
            .claim_task("workflow-1", "task-1", "worker-2", Some(Duration::seconds(300)))
            .await
            .unwrap();
        assert!(claim2.is_none());
    }

    #[tokio::test]
    async fn test_claim_task_expired_claim_replaced() {
        let backend = backend_with_task().await;

        let claim1 = backend
            .claim_task("workflow-1", "task-1", "worker-1", Some(Duration::seconds(0)))
            .await
            .unwrap();
        assert!(claim1.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let claim2 = backend
            .claim_task("workflow-1", "task-1", "worker-2", Some(Duration::seconds(300)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim2.worker_id, "worker-2");
    }

    #[tokio::test]
    async fn test_release_task_claim_wrong_worker() {
        let backend = backend_with_task().await;
        backend
            .claim_task("workflow-1", "task-1", "worker-1", Some(Duration::seconds(300)))
            .await
            .unwrap();

        let result = backend
            .release_task_claim("workflow-1", "task-1", "worker-2")
            .await;
        assert!(matches!(result, Err(BackendError::Backend(_))));

        backend
            .release_task_claim("workflow-1", "task-1", "worker-1")
            .await
            .unwrap();
        let claim = backend
            .claim_task("workflow-1", "task-1", "worker-2", None)
            .await
            .unwrap();
        assert!(claim.is_some());
    }

    #[tokio::test]
    async fn test_extend_task_claim_success() {
        let backend = backend_with_task().await;
        let claim = backend
            .claim_task("workflow-1", "task-1", "worker-1", Some(Duration::seconds(10)))
            .await
            .unwrap()
            .unwrap();
        let original_expiry = claim.expires_at.unwrap();

        backend
            .extend_task_claim("workflow-1", "task-1", "worker-1", Duration::seconds(300))
            .await
            .unwrap();

        let claims = backend.claims.read().unwrap();
        let key = InMemoryBackend::claim_key("workflow-1", "task-1");
        let extended_claim = claims.get(&key).unwrap();
        assert!(extended_claim.expires_at.unwrap() > original_expiry);
    }

    #[tokio::test]
    async fn test_extend_task_claim_not_found() {
        let backend = InMemoryBackend::new();
        let result = backend
            .extend_task_claim("workflow-1", "task-1", "worker-1", Duration::seconds(300))
            .await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancellation_requires_existing_run() {
        let backend = InMemoryBackend::new();
        let result = backend.request_cancellation("missing", "user").await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));

        backend.save_snapshot(snapshot("run-1")).await.unwrap();
        assert!(backend.cancellation_reason("run-1").await.unwrap().is_none());

        backend.request_cancellation("run-1", "first").await.unwrap();
        backend.request_cancellation("run-1", "second").await.unwrap();
        assert_eq!(
            backend.cancellation_reason("run-1").await.unwrap().as_deref(),
            Some("first")
        );
    }
}
