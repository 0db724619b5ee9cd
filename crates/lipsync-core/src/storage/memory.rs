use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::runtime::types::{JobId, JobRecord, TaskId, TaskRecord, TaskUpdate};
use crate::storage::{JobStore, StoreError, TaskStore};

/// In-process store backed by `tokio::sync::RwLock<HashMap>`.
///
/// Many readers can observe task status concurrently while the owning
/// pipeline run updates it; an update holds the write lock for the whole
/// validate-and-apply step, so readers never see half-written records.
/// Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    tasks: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task records held.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

impl JobStore for MemoryStore {
    async fn create_job(&self, job: JobRecord) -> Result<(), StoreError> {
        let mut guard = self.jobs.write().await;
        if guard.contains_key(&job.job_id) {
            return Err(StoreError::Duplicate(job.job_id.to_string()));
        }
        guard.insert(job.job_id, job);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }
}

impl TaskStore for MemoryStore {
    async fn create_task(&self, task: TaskRecord) -> Result<(), StoreError> {
        let mut guard = self.tasks.write().await;
        if guard.contains_key(&task.task_id) {
            return Err(StoreError::Duplicate(task.task_id.to_string()));
        }
        guard.insert(task.task_id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<TaskRecord, StoreError> {
        let mut guard = self.tasks.write().await;
        let record = guard
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        // Apply to a copy so a rejected update leaves the stored record intact.
        let mut next = record.clone();
        next.apply(&update, Utc::now())?;
        *record = next.clone();
        Ok(next)
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let mut unfinished: Vec<TaskRecord> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|t| t.created_at);
        Ok(unfinished)
    }
}
