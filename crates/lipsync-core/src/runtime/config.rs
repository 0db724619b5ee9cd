use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::types::{RuntimeError, StageKind};

/// Maximum wall-clock time each stage may run before it is failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub preprocess: Duration,
    pub tts: Duration,
    pub lipsync: Duration,
    pub postprocess: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, kind: StageKind) -> Duration {
        match kind {
            StageKind::Preprocess => self.preprocess,
            StageKind::Tts => self.tts,
            StageKind::Lipsync => self.lipsync,
            StageKind::Postprocess => self.postprocess,
        }
    }

    pub fn set(&mut self, kind: StageKind, limit: Duration) {
        match kind {
            StageKind::Preprocess => self.preprocess = limit,
            StageKind::Tts => self.tts = limit,
            StageKind::Lipsync => self.lipsync = limit,
            StageKind::Postprocess => self.postprocess = limit,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            preprocess: Duration::from_secs(120),
            tts: Duration::from_secs(60),
            // CPU inference is slow; a hung process must still release the gate.
            lipsync: Duration::from_secs(30 * 60),
            postprocess: Duration::from_secs(120),
        }
    }
}

/// Orchestrator configuration.
///
/// All fields have sensible defaults via [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Execution gate capacity: pipelines allowed to run at once. Defaults to `1`.
    pub concurrency: usize,
    /// Worker pool size. `None` means "same as `concurrency`".
    pub workers: Option<usize>,
    /// Capacity of the work queue. Defaults to `64`.
    pub queue_capacity: usize,
    /// Maximum text length in characters. Defaults to `200`.
    pub max_text_chars: usize,
    /// Maximum synthesized-audio to source-video duration ratio. Defaults to `1.5`.
    pub max_audio_video_ratio: f64,
    pub stage_timeouts: StageTimeouts,
    /// Parent of the per-task scratch directories.
    pub work_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 1,
            workers: None,
            queue_capacity: 64,
            max_text_chars: 200,
            max_audio_video_ratio: 1.5,
            stage_timeouts: StageTimeouts::default(),
            work_root: std::env::temp_dir().join("lipsync"),
        }
    }
}

impl Config {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.concurrency)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.concurrency == 0 {
            return Err(RuntimeError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.worker_count() == 0 {
            return Err(RuntimeError::InvalidConfig(
                "worker count must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RuntimeError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.max_text_chars == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max text length must be at least 1".into(),
            ));
        }
        if !(self.max_audio_video_ratio.is_finite() && self.max_audio_video_ratio > 0.0) {
            return Err(RuntimeError::InvalidConfig(format!(
                "max audio/video ratio must be a positive number, got {}",
                self.max_audio_video_ratio
            )));
        }
        for kind in StageKind::ORDER {
            if self.stage_timeouts.for_stage(kind).is_zero() {
                return Err(RuntimeError::InvalidConfig(format!(
                    "{kind} stage timeout must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.worker_count(), 1);
        assert_eq!(cfg.max_text_chars, 200);
        assert_eq!(cfg.max_audio_video_ratio, 1.5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = Config {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RuntimeError::InvalidConfig(_))));
    }

    #[test]
    fn zero_stage_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.stage_timeouts.set(StageKind::Tts, Duration::ZERO);
        assert!(cfg.validate().is_err());
    }
}
