use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::runtime::types::{Artifact, Artifacts, StageFailure, StageKind};

/// One collaborator slot of the pipeline.
///
/// Implementations wrap an external tool (ffmpeg, a TTS engine, the lip-sync
/// model, ...) and turn its result into an [`Artifact`] or a [`StageFailure`].
/// The driver never inspects which implementation it holds; it only uses
/// [`Stage::kind`] to place the stage and label the task status.
///
/// Stages are not idempotent: they write files and call non-retry-safe
/// processes. The driver invokes each one at most once per task.
///
/// A timed-out stage is torn down before its gate slot is released, so an
/// async stage never overlaps the next task. [`FnStage`] is the exception:
/// its blocking closure cannot be interrupted and may still be running.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn kind(&self) -> StageKind;

    async fn run(&self, artifacts: &Artifacts) -> Result<Artifact, StageFailure>;
}

/// Type alias for the boxed synchronous stage closure.
pub type StageFn = Arc<dyn Fn(Artifacts) -> Result<Artifact, StageFailure> + Send + Sync + 'static>;

// ─── Closure Stage ────────────────────────────────────────────────────────────

/// A stage that runs synchronous, blocking logic inside `spawn_blocking`.
///
/// Handy for in-process collaborators. Note that a timed-out closure cannot be
/// interrupted; the driver stops waiting for it but the thread runs on.
#[derive(Clone)]
pub struct FnStage {
    kind: StageKind,
    work: StageFn,
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("kind", &self.kind).finish()
    }
}

impl FnStage {
    pub fn new(
        kind: StageKind,
        work: impl Fn(Artifacts) -> Result<Artifact, StageFailure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            work: Arc::new(work),
        }
    }
}

#[async_trait]
impl Stage for FnStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, artifacts: &Artifacts) -> Result<Artifact, StageFailure> {
        let work = Arc::clone(&self.work);
        let input = artifacts.clone();
        let kind = self.kind;
        tokio::task::spawn_blocking(move || work(input))
            .await
            .map_err(|_| StageFailure::collaborator(format!("{kind} stage panicked")))?
    }
}

// ─── Invocation ───────────────────────────────────────────────────────────────

/// Run `stage` in its own task, bounded by `limit`.
///
/// A panic inside the stage becomes a collaborator failure instead of taking
/// the worker down. On timeout the stage task is aborted, which drops any
/// child process handle the stage holds (adapters spawn with `kill_on_drop`).
/// The aborted task is awaited so that teardown has finished on return.
pub(crate) async fn invoke(
    stage: Arc<dyn Stage>,
    artifacts: Artifacts,
    limit: Duration,
) -> Result<Artifact, StageFailure> {
    let kind = stage.kind();
    let mut handle = tokio::spawn(async move { stage.run(&artifacts).await });

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) if join_err.is_panic() => Err(StageFailure::collaborator(format!(
            "{kind} stage panicked"
        ))),
        Ok(Err(_)) => Err(StageFailure::collaborator(format!(
            "{kind} stage was cancelled"
        ))),
        Err(_) => {
            handle.abort();
            // Let the aborted future drop (and kill its child) before the
            // caller releases the gate.
            let _ = handle.await;
            Err(StageFailure::timeout(kind, limit))
        }
    }
}
