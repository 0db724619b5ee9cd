use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoreError;

/// Identifier of an uploaded input artifact.
pub type JobId = Uuid;

/// Identifier of one pipeline execution against a job.
pub type TaskId = Uuid;

/// Lifecycle state shared by the store and the polling contract.
///
/// The string forms (`"queued"`, `"lipsync"`, ...) are part of the public
/// contract and are what the store persists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    /// A job whose input has been stored. Tasks never enter this state.
    Uploaded,
    /// Task recorded and enqueued, waiting for a worker and a gate slot.
    Queued,
    Preprocessing,
    Tts,
    Lipsync,
    Postprocessing,
    /// Terminal success; `output_path` is set.
    Done,
    /// Terminal failure; `error_message` is set.
    Error,
}

impl TaskStatus {
    /// Returns `true` for `done` and `error`. Terminal records are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }

    /// The pipeline stage this status labels, if any.
    pub fn stage(self) -> Option<StageKind> {
        match self {
            TaskStatus::Preprocessing => Some(StageKind::Preprocess),
            TaskStatus::Tts => Some(StageKind::Tts),
            TaskStatus::Lipsync => Some(StageKind::Lipsync),
            TaskStatus::Postprocessing => Some(StageKind::Postprocess),
            _ => None,
        }
    }

    /// Whether a task in `self` may move to `next`.
    ///
    /// Forward edges follow the stage order one step at a time, `error` is
    /// reachable from every non-terminal task state, and a stage status may be
    /// rewritten with itself (progress ticks inside a stage).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Done | Error, _) | (Uploaded, _) | (_, Uploaded) => false,
            (_, Error) => true,
            (Queued, Preprocessing)
            | (Preprocessing, Tts)
            | (Tts, Lipsync)
            | (Lipsync, Postprocessing)
            | (Postprocessing, Done) => true,
            (current, next) => current == next && current.stage().is_some(),
        }
    }
}

/// The four collaborator slots of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum StageKind {
    Preprocess,
    Tts,
    Lipsync,
    Postprocess,
}

impl StageKind {
    pub const ORDER: [StageKind; 4] = [
        StageKind::Preprocess,
        StageKind::Tts,
        StageKind::Lipsync,
        StageKind::Postprocess,
    ];

    /// Status written before the stage is invoked.
    pub fn status(self) -> TaskStatus {
        match self {
            StageKind::Preprocess => TaskStatus::Preprocessing,
            StageKind::Tts => TaskStatus::Tts,
            StageKind::Lipsync => TaskStatus::Lipsync,
            StageKind::Postprocess => TaskStatus::Postprocessing,
        }
    }

    /// Advisory progress written on entry to and on exit from the stage.
    pub fn progress_span(self) -> (u8, u8) {
        match self {
            StageKind::Preprocess => (5, 20),
            StageKind::Tts => (25, 40),
            StageKind::Lipsync => (45, 75),
            StageKind::Postprocess => (80, 95),
        }
    }
}

// ─── Records ──────────────────────────────────────────────────────────────────

/// One uploaded input artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub preview_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            input_path: input_path.into(),
            preview_path: None,
            created_at: Utc::now(),
        }
    }

    /// Jobs are read-only once created, so they always report `uploaded`.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::Uploaded
    }
}

/// One execution of the pipeline against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub text: String,
    pub status: TaskStatus,
    /// Advisory percentage in `0..=100`.
    pub progress: u8,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh `queued` record with a newly allocated id.
    pub fn queued(job_id: JobId, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            job_id,
            text: text.into(),
            status: TaskStatus::Queued,
            progress: 0,
            output_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate `update` against the state machine and apply it in place.
    ///
    /// Every store funnels writes through here so that the terminal
    /// immutability rule and the output/error exclusivity hold regardless of
    /// the backing storage.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::Terminal {
                task_id: self.task_id,
                status: self.status,
            });
        }

        let next = update.status();
        if !self.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                task_id: self.task_id,
                from: self.status,
                to: next,
            });
        }

        match update {
            TaskUpdate::Advance { status, progress } => {
                // Terminal states carry a payload; they go through Complete/Fail.
                if status.is_terminal() {
                    return Err(StoreError::IllegalTransition {
                        task_id: self.task_id,
                        from: self.status,
                        to: *status,
                    });
                }
                self.status = *status;
                self.progress = (*progress).min(100);
            }
            TaskUpdate::Complete { output_path } => {
                self.status = TaskStatus::Done;
                self.progress = 100;
                self.output_path = Some(output_path.clone());
                self.error_message = None;
            }
            TaskUpdate::Fail { message } => {
                self.status = TaskStatus::Error;
                self.output_path = None;
                self.error_message = Some(non_empty_message(message));
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// A single mutation of a task record.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Enter (or tick inside) a non-terminal state.
    Advance { status: TaskStatus, progress: u8 },
    /// Terminal success.
    Complete { output_path: PathBuf },
    /// Terminal failure.
    Fail { message: String },
}

impl TaskUpdate {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskUpdate::Advance { status, .. } => *status,
            TaskUpdate::Complete { .. } => TaskStatus::Done,
            TaskUpdate::Fail { .. } => TaskStatus::Error,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        TaskUpdate::Fail {
            message: message.into(),
        }
    }
}

fn non_empty_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        "task failed without an error message".to_owned()
    } else {
        trimmed.to_owned()
    }
}

// ─── Stage data ───────────────────────────────────────────────────────────────

/// A normalized video produced by the preprocess stage.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub fps: f64,
    pub duration_secs: f64,
}

/// Synthesized speech produced by the TTS stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInfo {
    pub path: PathBuf,
    pub duration_secs: f64,
}

/// Stage-to-stage output. Each stage produces exactly one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Normalized(MediaInfo),
    Speech(AudioInfo),
    Synced(PathBuf),
    Gif(PathBuf),
}

/// Everything a stage may read: the task inputs plus the artifacts produced
/// so far by earlier stages of the same run.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub input_path: PathBuf,
    pub text: String,
    /// Private scratch directory of this run.
    pub work_dir: PathBuf,
    pub video: Option<MediaInfo>,
    pub audio: Option<AudioInfo>,
    pub synced: Option<PathBuf>,
    pub gif: Option<PathBuf>,
}

impl Artifacts {
    pub fn new(task: &TaskRecord, job: &JobRecord, work_dir: PathBuf) -> Self {
        Self {
            task_id: task.task_id,
            job_id: job.job_id,
            input_path: job.input_path.clone(),
            text: task.text.clone(),
            work_dir,
            video: None,
            audio: None,
            synced: None,
            gif: None,
        }
    }

    pub fn absorb(&mut self, artifact: Artifact) {
        match artifact {
            Artifact::Normalized(info) => self.video = Some(info),
            Artifact::Speech(info) => self.audio = Some(info),
            Artifact::Synced(path) => self.synced = Some(path),
            Artifact::Gif(path) => self.gif = Some(path),
        }
    }

    pub fn require_video(&self) -> Result<&MediaInfo, StageFailure> {
        self.video
            .as_ref()
            .ok_or_else(|| StageFailure::collaborator("no normalized video available"))
    }

    pub fn require_audio(&self) -> Result<&AudioInfo, StageFailure> {
        self.audio
            .as_ref()
            .ok_or_else(|| StageFailure::collaborator("no synthesized audio available"))
    }

    pub fn require_synced(&self) -> Result<&PathBuf, StageFailure> {
        self.synced
            .as_ref()
            .ok_or_else(|| StageFailure::collaborator("no lip-synced video available"))
    }
}

// ─── Failures ─────────────────────────────────────────────────────────────────

/// Why a stage did not produce its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// A business rule rejected the input (duration ratio, no face, format).
    Policy,
    /// The external tool failed: bad exit code, missing or malformed output, panic.
    Collaborator,
    /// The stage exceeded its configured maximum duration.
    Timeout,
}

/// A stage-level failure. Converted by the driver into a terminal `error`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn policy(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Policy,
            message: message.into(),
        }
    }

    pub fn collaborator(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Collaborator,
            message: message.into(),
        }
    }

    pub fn timeout(stage: StageKind, limit: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!(
                "{stage} stage timed out after {:.1}s",
                limit.as_secs_f64()
            ),
        }
    }
}

/// Final result of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done { output_path: PathBuf },
    Failed { kind: FailureKind, message: String },
}

/// Rejections raised synchronously by `submit`; no task is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("text cannot be empty")]
    EmptyText,

    #[error("text must be {max} characters or fewer (got {len})")]
    TextTooLong { len: usize, max: usize },

    #[error("unsupported file type '{extension}'; upload a GIF or MP4")]
    UnsupportedFormat { extension: String },
}

/// Errors produced by the runtime layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The referenced job does not exist.
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    /// Another caller currently owns this task's execution.
    #[error("task {task_id} is already running")]
    AlreadyRunning { task_id: TaskId },

    /// The task already reached `done` or `error`.
    #[error("task {task_id} already finished ({status})")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    /// The task is mid-pipeline with no owner (left behind by a dead worker).
    #[error("task {task_id} cannot be started from status {status}")]
    NotRunnable { task_id: TaskId, status: TaskStatus },

    /// The work queue is at capacity.
    #[error("work queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The dispatcher no longer accepts or runs work.
    #[error("dispatcher shut down")]
    Shutdown,

    /// All execution gate slots are held.
    #[error("execution gate busy")]
    GateBusy,

    /// A timed wait for an execution gate slot exceeded its deadline.
    #[error("timed out waiting for the execution gate")]
    GateTimeout,

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The job/task store failed. Never converted into a task error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
