use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::runtime::stage::Stage;
use crate::runtime::types::{Artifact, Artifacts, MediaInfo, StageFailure, StageKind};
use crate::services::{ToolConfig, check_extension, command, probe};

const NO_FACE_MESSAGE: &str = "No face detected in the uploaded video. \
     Wav2Lip requires a clearly visible, forward-facing face.";

/// Normalizes the upload into a video Wav2Lip can read.
///
/// GIFs are re-encoded to H.264 at their detected frame rate; other video
/// containers are copied as is. The result is probed for frame rate and
/// duration, and checked for a face when a detector is configured.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    tools: Arc<ToolConfig>,
}

impl Preprocessor {
    pub fn new(tools: Arc<ToolConfig>) -> Self {
        Self { tools }
    }

    async fn gif_to_mp4(&self, input: &Path, output: &Path) -> Result<f64, StageFailure> {
        let fps = probe::gif_fps(&probe::probe(&self.tools.ffprobe, input).await?);
        info!(fps, "converting GIF to MP4");

        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(format!("fps={fps}"))
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(output);
        command::run(cmd, "GIF to MP4 conversion").await?;
        Ok(fps)
    }

    async fn detect_face(&self, detector: &Path, video: &Path) -> Result<(), StageFailure> {
        let mut cmd = Command::new(detector);
        cmd.arg(video);
        let output = command::output(cmd, "face detection").await?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) => Err(StageFailure::policy(NO_FACE_MESSAGE)),
            _ => Err(command::exit_failure("face detection", &output)),
        }
    }
}

#[async_trait]
impl Stage for Preprocessor {
    fn kind(&self) -> StageKind {
        StageKind::Preprocess
    }

    async fn run(&self, artifacts: &Artifacts) -> Result<Artifact, StageFailure> {
        let extension = check_extension(&artifacts.input_path)
            .map_err(|e| StageFailure::policy(e.to_string()))?;

        let normalized = if extension == "gif" {
            let target = artifacts.work_dir.join("input.mp4");
            self.gif_to_mp4(&artifacts.input_path, &target).await?;
            target
        } else {
            let target = artifacts.work_dir.join(format!("input.{extension}"));
            tokio::fs::copy(&artifacts.input_path, &target)
                .await
                .map_err(|e| {
                    StageFailure::collaborator(format!(
                        "failed to copy {} into the work directory: {e}",
                        artifacts.input_path.display()
                    ))
                })?;
            target
        };

        let info = probe::video_info(&probe::probe(&self.tools.ffprobe, &normalized).await?)?;
        info!(
            fps = info.fps,
            frames = info.frame_count,
            duration_secs = info.duration_secs,
            "normalized input"
        );

        if let Some(detector) = &self.tools.face_detector {
            self.detect_face(detector, &normalized).await?;
        }

        Ok(Artifact::Normalized(MediaInfo {
            path: normalized,
            fps: info.fps,
            duration_secs: info.duration_secs,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::runtime::types::{FailureKind, JobRecord, TaskRecord};

    fn artifacts(input: &str) -> Artifacts {
        let job = JobRecord::new(input);
        let task = TaskRecord::queued(job.job_id, "hi");
        Artifacts::new(&task, &job, PathBuf::from("/tmp/lipsync-preprocess-test"))
    }

    #[tokio::test]
    async fn unsupported_upload_is_a_policy_failure() {
        let stage = Preprocessor::new(Arc::default());
        let err = stage.run(&artifacts("/uploads/notes.txt")).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Policy);
        assert!(err.message.contains(".txt"));
    }

    #[tokio::test]
    async fn missing_upload_is_a_collaborator_failure() {
        let stage = Preprocessor::new(Arc::default());
        let err = stage
            .run(&artifacts("/nonexistent/lipsync/clip.mp4"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Collaborator);
    }
}
