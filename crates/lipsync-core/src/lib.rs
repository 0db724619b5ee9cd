mod runtime;

pub mod services;
pub mod storage;

pub use runtime::config::{Config, StageTimeouts};
pub use runtime::gate::{ExecutionGate, GatePermit};
pub use runtime::orchestrator::{Dispatcher, RecoveryReport};
pub use runtime::pipeline::{Pipeline, PipelineBuilder};
pub use runtime::stage::{FnStage, Stage, StageFn};
pub use runtime::types::{
    Artifact, Artifacts, AudioInfo, FailureKind, JobId, JobRecord, MediaInfo, RuntimeError,
    StageFailure, StageKind, TaskId, TaskOutcome, TaskRecord, TaskStatus, TaskUpdate,
    ValidationError,
};
