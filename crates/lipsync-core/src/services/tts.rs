use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::runtime::stage::Stage;
use crate::runtime::types::{Artifact, Artifacts, AudioInfo, StageFailure, StageKind};
use crate::services::{ToolConfig, command, probe};

/// Synthesizes the task text with the `edge-tts` CLI and converts the
/// result to the 16 kHz mono WAV Wav2Lip expects.
#[derive(Debug, Clone)]
pub struct SpeechSynthesizer {
    tools: Arc<ToolConfig>,
}

impl SpeechSynthesizer {
    pub fn new(tools: Arc<ToolConfig>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl Stage for SpeechSynthesizer {
    fn kind(&self) -> StageKind {
        StageKind::Tts
    }

    async fn run(&self, artifacts: &Artifacts) -> Result<Artifact, StageFailure> {
        if artifacts.text.trim().is_empty() {
            return Err(StageFailure::policy("text for speech synthesis cannot be empty"));
        }
        let mp3 = artifacts.work_dir.join("speech.mp3");
        let wav = artifacts.work_dir.join("speech.wav");

        info!(voice = %self.tools.voice, "synthesizing speech");
        let mut cmd = Command::new(&self.tools.edge_tts);
        // `--text=` keeps a leading dash in the text from parsing as a flag.
        cmd.arg("--voice")
            .arg(&self.tools.voice)
            .arg(format!("--text={}", artifacts.text))
            .arg("--write-media")
            .arg(&mp3);
        command::run(cmd, "edge-tts synthesis").await?;

        let size = tokio::fs::metadata(&mp3).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(StageFailure::collaborator(
                "speech synthesis produced an empty audio file",
            ));
        }

        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(&mp3)
            .args(["-ar", "16000", "-ac", "1"])
            .arg(&wav);
        command::run(cmd, "MP3 to WAV conversion").await?;

        let duration_secs = probe::duration(&self.tools.ffprobe, &wav).await?;
        info!(duration_secs, "speech ready");

        if let Err(e) = tokio::fs::remove_file(&mp3).await {
            debug!(error = %e, "failed to remove intermediate mp3");
        }

        Ok(Artifact::Speech(AudioInfo {
            path: wav,
            duration_secs,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::*;
    use crate::runtime::types::{FailureKind, JobRecord, TaskRecord};

    #[tokio::test]
    async fn missing_tts_binary_fails_the_stage() {
        let tools = ToolConfig {
            edge_tts: "/nonexistent/edge-tts".into(),
            ..ToolConfig::default()
        };
        let stage = SpeechSynthesizer::new(Arc::new(tools));
        let job = JobRecord::new("/uploads/clip.gif");
        let task = TaskRecord::queued(job.job_id, "hello");
        let artifacts = Artifacts::new(&task, &job, PathBuf::from("/tmp/lipsync-tts-test"));

        let err = stage.run(&artifacts).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Collaborator);
        assert!(err.message.contains("edge-tts"));
    }
}
