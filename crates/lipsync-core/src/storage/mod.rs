//! Job/task store contract.
//!
//! [`JobStore`] and [`TaskStore`] define what the dispatcher and the HTTP
//! layer need from persistence. Two implementations ship with the crate:
//! [`memory::MemoryStore`] for tests and single-process embedding, and
//! [`sqlite::SqliteStore`] for durable state that survives a restart.
//!
//! All trait methods use `impl Future` in their signatures (stable since Rust
//! 1.75) so no extra `async-trait` crate is required.
//!
//! Writes to a task go through [`TaskStore::update_task`], which must apply
//! the mutation atomically with respect to readers and must reject updates
//! to terminal records.

pub mod memory;
pub mod sqlite;

use std::future::Future;

use thiserror::Error;

use crate::runtime::types::{JobId, JobRecord, TaskId, TaskRecord, TaskStatus, TaskUpdate};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors surfaced by a store. These are infrastructure faults from the
/// pipeline's point of view and are never turned into task errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("task {task_id} is terminal ({status}); record is immutable")]
    Terminal { task_id: TaskId, status: TaskStatus },

    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} kept changing during update")]
    Conflict(String),

    #[error("corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence for uploaded jobs. Jobs are immutable once created.
pub trait JobStore: Send + Sync + 'static {
    fn create_job(&self, job: JobRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_job(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = Result<Option<JobRecord>, StoreError>> + Send;
}

/// Persistence for pipeline tasks.
pub trait TaskStore: Send + Sync + 'static {
    fn create_task(&self, task: TaskRecord)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_task(
        &self,
        task_id: TaskId,
    ) -> impl Future<Output = Result<Option<TaskRecord>, StoreError>> + Send;

    /// Apply `update` and return the record as written.
    fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> impl Future<Output = Result<TaskRecord, StoreError>> + Send;

    /// Every task not yet in a terminal state, oldest first.
    fn list_unfinished(&self) -> impl Future<Output = Result<Vec<TaskRecord>, StoreError>> + Send;
}

/// Convenience bound for a store that holds both jobs and tasks.
pub trait Store: JobStore + TaskStore {}

impl<T: JobStore + TaskStore> Store for T {}
