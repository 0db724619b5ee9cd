//! Stage adapters that drive the external tools: `ffmpeg`/`ffprobe`,
//! `edge-tts`, Wav2Lip and `gifsicle`.
//!
//! Every adapter spawns its tools through [`tokio::process::Command`] with
//! `kill_on_drop`, so a stage that times out takes its child process down
//! with it.

mod command;
pub mod gif;
pub mod lipsync;
pub mod preprocess;
pub mod probe;
pub mod tts;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::runtime::config::Config;
use crate::runtime::pipeline::Pipeline;
use crate::runtime::types::{RuntimeError, ValidationError};

pub use gif::GifEncoder;
pub use lipsync::LipSyncer;
pub use preprocess::Preprocessor;
pub use tts::SpeechSynthesizer;

/// Upload extensions the preprocess stage can normalize.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = ["gif", "mp4", "mov", "webm", "avi"];

/// Lower-cased extension of `path` if it is one of [`SUPPORTED_EXTENSIONS`].
pub fn check_extension(path: &Path) -> Result<String, ValidationError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(ValidationError::UnsupportedFormat {
            extension: if extension.is_empty() {
                "(none)".to_owned()
            } else {
                format!(".{extension}")
            },
        })
    }
}

/// Locations and knobs of the external tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub edge_tts: PathBuf,
    pub gifsicle: PathBuf,
    /// Interpreter used to run Wav2Lip's `inference.py`.
    pub python: PathBuf,
    pub wav2lip_dir: PathBuf,
    pub checkpoint: PathBuf,
    /// Edge TTS voice name.
    pub voice: String,
    /// Optional face detector. Invoked as `<detector> <video>`; exit 0 means a
    /// face was found, exit 1 means none was.
    pub face_detector: Option<PathBuf>,
    pub gif_width: u32,
    pub gif_max_fps: f64,
    /// Where finished GIFs are written, as `<task_id>.gif`.
    pub output_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            edge_tts: "edge-tts".into(),
            gifsicle: "gifsicle".into(),
            python: "python".into(),
            wav2lip_dir: "./wav2lip".into(),
            checkpoint: "./models/wav2lip_gan.pth".into(),
            voice: "en-US-GuyNeural".into(),
            face_detector: None,
            gif_width: 480,
            gif_max_fps: 30.0,
            output_dir: "./outputs".into(),
        }
    }
}

/// The production pipeline: preprocess, TTS, Wav2Lip, GIF encode.
///
/// Without a [`ToolConfig::face_detector`] the preprocess stage skips the
/// face check, so clips with no face only fail later inside Wav2Lip.
pub fn pipeline(tools: ToolConfig, config: &Config) -> Result<Pipeline, RuntimeError> {
    if tools.face_detector.is_none() {
        warn!("no face detector configured; uploads will not be checked for a face");
    }
    let tools = Arc::new(tools);
    Pipeline::builder(config)
        .stage(Preprocessor::new(Arc::clone(&tools)))
        .stage(SpeechSynthesizer::new(Arc::clone(&tools)))
        .stage(LipSyncer::new(Arc::clone(&tools)))
        .stage(GifEncoder::new(tools))
        .build()
}

#[cfg(test)]
mod test {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn missing_face_detector_is_reported() {
        pipeline(ToolConfig::default(), &Config::default()).expect("pipeline");
        assert!(logs_contain("no face detector configured"));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert_eq!(check_extension(Path::new("/up/clip.GIF")).unwrap(), "gif");
        assert_eq!(check_extension(Path::new("clip.webm")).unwrap(), "webm");
    }

    #[test]
    fn unsupported_extensions_are_rejected() {
        assert_eq!(
            check_extension(Path::new("notes.txt")),
            Err(ValidationError::UnsupportedFormat {
                extension: ".txt".into()
            })
        );
        assert!(check_extension(Path::new("noext")).is_err());
    }

    #[test]
    fn production_pipeline_builds() {
        assert!(pipeline(ToolConfig::default(), &Config::default()).is_ok());
    }
}
