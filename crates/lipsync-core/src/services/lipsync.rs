use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::runtime::stage::Stage;
use crate::runtime::types::{Artifact, Artifacts, AudioInfo, MediaInfo, StageFailure, StageKind};
use crate::services::{ToolConfig, command};

/// Runs Wav2Lip inference over the normalized video and the speech track.
///
/// Speech shorter than the clip is padded with silence first so the whole
/// clip stays in the output. The tool's stdout and stderr are kept in
/// `lipsync.log` in the work directory.
#[derive(Debug, Clone)]
pub struct LipSyncer {
    tools: Arc<ToolConfig>,
}

impl LipSyncer {
    pub fn new(tools: Arc<ToolConfig>) -> Self {
        Self { tools }
    }

    async fn ensure_installed(&self) -> Result<PathBuf, StageFailure> {
        let script = self.tools.wav2lip_dir.join("inference.py");
        if !exists(&script).await {
            return Err(StageFailure::collaborator(format!(
                "Wav2Lip inference script not found at {}",
                script.display()
            )));
        }
        if !exists(&self.tools.checkpoint).await {
            return Err(StageFailure::collaborator(format!(
                "Wav2Lip model not found at {}",
                self.tools.checkpoint.display()
            )));
        }
        Ok(script)
    }

    async fn fit_audio(
        &self,
        video: &MediaInfo,
        audio: &AudioInfo,
        work_dir: &Path,
    ) -> Result<PathBuf, StageFailure> {
        if video.duration_secs <= 0.0 || audio.duration_secs >= video.duration_secs {
            return Ok(audio.path.clone());
        }
        info!(
            audio_secs = audio.duration_secs,
            video_secs = video.duration_secs,
            "padding speech with silence"
        );
        let padded = work_dir.join("audio_padded.wav");
        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(&audio.path)
            .args(["-af", "apad", "-t"])
            .arg(format!("{:.3}", video.duration_secs))
            .arg(&padded);
        command::run(cmd, "audio silence padding").await?;
        Ok(padded)
    }
}

#[async_trait]
impl Stage for LipSyncer {
    fn kind(&self) -> StageKind {
        StageKind::Lipsync
    }

    async fn run(&self, artifacts: &Artifacts) -> Result<Artifact, StageFailure> {
        let video = artifacts.require_video()?;
        let audio = artifacts.require_audio()?;
        let script = self.ensure_installed().await?;
        let audio_path = self.fit_audio(video, audio, &artifacts.work_dir).await?;

        let synced = artifacts.work_dir.join("synced.mp4");
        let log_path = artifacts.work_dir.join("lipsync.log");

        let mut cmd = Command::new(&self.tools.python);
        cmd.arg(&script)
            .arg("--checkpoint_path")
            .arg(&self.tools.checkpoint)
            .arg("--face")
            .arg(&video.path)
            .arg("--audio")
            .arg(&audio_path)
            .arg("--outfile")
            .arg(&synced)
            .args(["--pads", "0", "10", "0", "0", "--resize_factor", "1", "--nosmooth"]);

        info!("running Wav2Lip inference");
        let output = command::output(cmd, "Wav2Lip inference").await?;
        write_log(&log_path, &output).await;

        if !output.status.success() {
            let failure = command::exit_failure("Wav2Lip inference", &output);
            return Err(StageFailure::collaborator(format!(
                "{}; see {}",
                failure.message,
                log_path.display()
            )));
        }
        if !exists(&synced).await {
            return Err(StageFailure::collaborator(format!(
                "Wav2Lip did not produce an output file at {}; see {}",
                synced.display(),
                log_path.display()
            )));
        }

        info!(output = %synced.display(), "Wav2Lip finished");
        Ok(Artifact::Synced(synced))
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn write_log(path: &Path, output: &Output) {
    let mut log = Vec::with_capacity(output.stdout.len() + output.stderr.len() + 32);
    log.extend_from_slice(b"=== STDOUT ===\n");
    log.extend_from_slice(&output.stdout);
    log.extend_from_slice(b"\n=== STDERR ===\n");
    log.extend_from_slice(&output.stderr);
    if let Err(e) = tokio::fs::write(path, log).await {
        warn!(path = %path.display(), error = %e, "failed to write lipsync log");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::types::{FailureKind, JobRecord, TaskRecord};

    fn ready_artifacts() -> Artifacts {
        let job = JobRecord::new("/uploads/clip.gif");
        let task = TaskRecord::queued(job.job_id, "hello");
        let mut artifacts = Artifacts::new(&task, &job, PathBuf::from("/tmp/lipsync-w2l-test"));
        artifacts.absorb(Artifact::Normalized(MediaInfo {
            path: "/tmp/lipsync-w2l-test/input.mp4".into(),
            fps: 10.0,
            duration_secs: 3.0,
        }));
        artifacts.absorb(Artifact::Speech(AudioInfo {
            path: "/tmp/lipsync-w2l-test/speech.wav".into(),
            duration_secs: 2.0,
        }));
        artifacts
    }

    #[tokio::test]
    async fn missing_wav2lip_checkout_fails_before_inference() {
        let tools = ToolConfig {
            wav2lip_dir: "/nonexistent/wav2lip".into(),
            ..ToolConfig::default()
        };
        let err = LipSyncer::new(Arc::new(tools))
            .run(&ready_artifacts())
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Collaborator);
        assert!(err.message.contains("inference script not found"));
    }

    #[tokio::test]
    async fn requires_earlier_artifacts() {
        let job = JobRecord::new("/uploads/clip.gif");
        let task = TaskRecord::queued(job.job_id, "hello");
        let bare = Artifacts::new(&task, &job, PathBuf::from("/tmp/x"));
        let err = LipSyncer::new(Arc::default()).run(&bare).await.unwrap_err();
        assert!(err.message.contains("normalized video"));
    }
}
