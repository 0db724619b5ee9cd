use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{Instrument, error, info, info_span, warn};

use crate::runtime::config::{Config, StageTimeouts};
use crate::runtime::stage::{Stage, invoke};
use crate::runtime::types::{
    Artifact, Artifacts, JobRecord, RuntimeError, StageFailure, StageKind, TaskOutcome,
    TaskRecord, TaskUpdate,
};
use crate::storage::{StoreError, TaskStore};

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Declarative pipeline builder.
///
/// Append one stage per [`StageKind`] in execution order, then call
/// [`PipelineBuilder::build`]. Any other shape (missing, repeated or
/// out-of-order stages) is rejected with [`RuntimeError::InvalidPipeline`].
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    timeouts: StageTimeouts,
    max_ratio: f64,
    work_root: PathBuf,
}

impl PipelineBuilder {
    /// Create a builder that takes timeouts, the ratio limit and the work
    /// root from `config`.
    pub fn new(config: &Config) -> Self {
        Self {
            stages: Vec::with_capacity(StageKind::ORDER.len()),
            timeouts: config.stage_timeouts,
            max_ratio: config.max_audio_video_ratio,
            work_root: config.work_root.clone(),
        }
    }

    /// Append a stage.
    pub fn stage(self, stage: impl Stage) -> Self {
        self.shared_stage(Arc::new(stage))
    }

    /// Append an already shared stage.
    pub fn shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<Pipeline, RuntimeError> {
        let kinds: Vec<StageKind> = self.stages.iter().map(|s| s.kind()).collect();
        if kinds.as_slice() != StageKind::ORDER.as_slice() {
            return Err(RuntimeError::InvalidPipeline(format!(
                "expected stages {:?}, got {:?}",
                StageKind::ORDER,
                kinds
            )));
        }
        Ok(Pipeline {
            stages: self.stages,
            timeouts: self.timeouts,
            max_ratio: self.max_ratio,
            work_root: self.work_root,
        })
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

/// The four-stage lip-sync pipeline and the driver that walks a task
/// through it.
///
/// The driver is the only writer of a task record while it runs. Every
/// stage failure ends in a terminal `error` record; only store failures
/// escape [`Pipeline::execute`] as `Err`.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    timeouts: StageTimeouts,
    max_ratio: f64,
    work_root: PathBuf,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("timeouts", &self.timeouts)
            .field("max_ratio", &self.max_ratio)
            .field("work_root", &self.work_root)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn builder(config: &Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn timeouts(&self) -> &StageTimeouts {
        &self.timeouts
    }

    /// Drive `task` from `queued` to `done` or `error`.
    ///
    /// The caller must hold an execution gate permit for the whole call.
    pub async fn execute<S: TaskStore>(
        &self,
        task: &TaskRecord,
        job: &JobRecord,
        store: &S,
    ) -> Result<TaskOutcome, StoreError> {
        let span = info_span!("pipeline", task_id = %task.task_id, job_id = %job.job_id);
        self.drive(task, job, store).instrument(span).await
    }

    async fn drive<S: TaskStore>(
        &self,
        task: &TaskRecord,
        job: &JobRecord,
        store: &S,
    ) -> Result<TaskOutcome, StoreError> {
        let task_id = task.task_id;
        let started = Instant::now();

        let work_dir = self.work_root.join(task_id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            let failure = StageFailure::collaborator(format!(
                "failed to create work directory {}: {e}",
                work_dir.display()
            ));
            return fail(store, task, failure).await;
        }
        let mut artifacts = Artifacts::new(task, job, work_dir);

        for stage in &self.stages {
            let kind = stage.kind();

            if kind == StageKind::Lipsync {
                if let Err(failure) = self.check_duration_ratio(&artifacts) {
                    return fail(store, task, failure).await;
                }
            }

            let (enter, exit) = kind.progress_span();
            store
                .update_task(
                    task_id,
                    TaskUpdate::Advance {
                        status: kind.status(),
                        progress: enter,
                    },
                )
                .await?;

            let limit = self.timeouts.for_stage(kind);
            let stage_started = Instant::now();
            info!(stage = %kind, timeout_secs = limit.as_secs_f64(), "stage started");

            let artifact = match invoke(Arc::clone(stage), artifacts.clone(), limit).await {
                Ok(artifact) => artifact,
                Err(failure) => {
                    warn!(
                        stage = %kind,
                        kind = %failure.kind,
                        error = %failure.message,
                        elapsed_ms = stage_started.elapsed().as_millis() as u64,
                        "stage failed"
                    );
                    return fail(store, task, failure).await;
                }
            };
            if !produces(kind, &artifact) {
                let failure = StageFailure::collaborator(format!(
                    "{kind} stage returned an unexpected artifact"
                ));
                return fail(store, task, failure).await;
            }
            artifacts.absorb(artifact);

            store
                .update_task(
                    task_id,
                    TaskUpdate::Advance {
                        status: kind.status(),
                        progress: exit,
                    },
                )
                .await?;
            info!(
                stage = %kind,
                elapsed_ms = stage_started.elapsed().as_millis() as u64,
                "stage completed"
            );
        }

        let Some(output_path) = artifacts.gif.clone() else {
            return fail(
                store,
                task,
                StageFailure::collaborator("postprocess stage produced no GIF"),
            )
            .await;
        };

        store
            .update_task(
                task_id,
                TaskUpdate::Complete {
                    output_path: output_path.clone(),
                },
            )
            .await?;
        info!(
            output = %output_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task done"
        );
        Ok(TaskOutcome::Done { output_path })
    }

    /// Speech may run at most `max_ratio` times as long as the source clip.
    fn check_duration_ratio(&self, artifacts: &Artifacts) -> Result<(), StageFailure> {
        let video = artifacts.require_video()?;
        let audio = artifacts.require_audio()?;

        if video.duration_secs <= 0.0 {
            return Err(StageFailure::policy(
                "source clip has no measurable duration",
            ));
        }
        let ratio = audio.duration_secs / video.duration_secs;
        if ratio > self.max_ratio {
            return Err(StageFailure::policy(format!(
                "audio/video duration mismatch: speech lasts {:.1}s but the clip is only {:.1}s \
                 (ratio {:.2} > {:.2}); try shorter text",
                audio.duration_secs, video.duration_secs, ratio, self.max_ratio
            )));
        }
        Ok(())
    }
}

fn produces(kind: StageKind, artifact: &Artifact) -> bool {
    matches!(
        (kind, artifact),
        (StageKind::Preprocess, Artifact::Normalized(_))
            | (StageKind::Tts, Artifact::Speech(_))
            | (StageKind::Lipsync, Artifact::Synced(_))
            | (StageKind::Postprocess, Artifact::Gif(_))
    )
}

async fn fail<S: TaskStore>(
    store: &S,
    task: &TaskRecord,
    failure: StageFailure,
) -> Result<TaskOutcome, StoreError> {
    let record = store
        .update_task(task.task_id, TaskUpdate::fail(failure.message.clone()))
        .await
        .inspect_err(|e| error!(error = %e, "failed to record task failure"))?;
    info!(kind = %failure.kind, error = ?record.error_message, "task failed");
    Ok(TaskOutcome::Failed {
        kind: failure.kind,
        message: record.error_message.unwrap_or(failure.message),
    })
}
