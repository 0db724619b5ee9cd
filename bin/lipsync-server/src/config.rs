//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use lipsync_core::services::ToolConfig;
use lipsync_core::{StageKind, StageTimeouts};

/// Runtime configuration for lipsync-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://lipsync.db"`).
    pub database_url: String,

    /// Uploads land in `<temp_dir>/<job_id>/`; per-task scratch space lives
    /// under `<temp_dir>/work/`.
    pub temp_dir: PathBuf,

    /// Finished GIFs, served by `GET /output/{filename}`.
    pub output_dir: PathBuf,

    /// Upload size limit in MiB.
    pub max_upload_mb: usize,

    /// Comma-separated list of allowed CORS origins. `None` allows any origin.
    pub cors_allowed_origins: Option<String>,

    /// Serve Swagger UI at `/swagger-ui`.
    pub enable_swagger: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When set, logs are also written to a daily-rotated file in this directory.
    pub log_dir: Option<PathBuf>,

    /// Dispatcher settings handed to `lipsync-core`.
    pub runtime: lipsync_core::Config,

    /// External tool locations handed to the production pipeline.
    ///
    /// The face check is opt-in: set `LIPSYNC_FACE_DETECTOR` to a program that
    /// exits 0 when the clip shows a face and 1 when it does not. Without it
    /// uploads are never rejected for lacking a face.
    pub tools: ToolConfig,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env(&lookup);

        let temp_dir = PathBuf::from(env.or("LIPSYNC_TEMP_DIR", "./temp"));
        let output_dir = PathBuf::from(env.or("LIPSYNC_OUTPUT_DIR", "./outputs"));

        let core_defaults = lipsync_core::Config::default();
        let runtime = lipsync_core::Config {
            concurrency: env.parse("LIPSYNC_CONCURRENCY", core_defaults.concurrency),
            workers: env.get("LIPSYNC_WORKERS").and_then(|v| v.parse().ok()),
            queue_capacity: env.parse("LIPSYNC_QUEUE_CAPACITY", core_defaults.queue_capacity),
            max_text_chars: env.parse("LIPSYNC_MAX_TEXT_CHARS", core_defaults.max_text_chars),
            max_audio_video_ratio: env.parse(
                "LIPSYNC_MAX_AUDIO_VIDEO_RATIO",
                core_defaults.max_audio_video_ratio,
            ),
            stage_timeouts: stage_timeouts(&env),
            work_root: temp_dir.join("work"),
        };

        let tool_defaults = ToolConfig::default();
        let tools = ToolConfig {
            ffmpeg: env.path("LIPSYNC_FFMPEG", tool_defaults.ffmpeg),
            ffprobe: env.path("LIPSYNC_FFPROBE", tool_defaults.ffprobe),
            edge_tts: env.path("LIPSYNC_EDGE_TTS", tool_defaults.edge_tts),
            gifsicle: env.path("LIPSYNC_GIFSICLE", tool_defaults.gifsicle),
            python: env.path("LIPSYNC_PYTHON", tool_defaults.python),
            wav2lip_dir: env.path("LIPSYNC_WAV2LIP_DIR", tool_defaults.wav2lip_dir),
            checkpoint: env.path("LIPSYNC_MODEL_PATH", tool_defaults.checkpoint),
            voice: env.or("LIPSYNC_TTS_VOICE", &tool_defaults.voice),
            face_detector: env.get("LIPSYNC_FACE_DETECTOR").map(PathBuf::from),
            gif_width: env.parse("LIPSYNC_GIF_WIDTH", tool_defaults.gif_width),
            gif_max_fps: env.parse("LIPSYNC_GIF_MAX_FPS", tool_defaults.gif_max_fps),
            output_dir: output_dir.clone(),
        };

        Self {
            bind_address: env.or("LIPSYNC_BIND", "0.0.0.0:8000"),
            database_url: env.or("LIPSYNC_DATABASE_URL", "sqlite://lipsync.db"),
            temp_dir,
            output_dir,
            max_upload_mb: env.parse("LIPSYNC_MAX_UPLOAD_MB", 50),
            cors_allowed_origins: env.get("LIPSYNC_CORS_ORIGINS"),
            enable_swagger: env.flag("LIPSYNC_ENABLE_SWAGGER", true),
            log_level: env.or("LIPSYNC_LOG", "info"),
            log_json: env.flag("LIPSYNC_LOG_JSON", false),
            log_dir: env.get("LIPSYNC_LOG_DIR").map(PathBuf::from),
            runtime,
            tools,
        }
    }

    /// Upload size limit in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

fn stage_timeouts(env: &Env<'_>) -> StageTimeouts {
    let mut timeouts = StageTimeouts::default();
    for (kind, key) in [
        (StageKind::Preprocess, "LIPSYNC_TIMEOUT_PREPROCESS_SECS"),
        (StageKind::Tts, "LIPSYNC_TIMEOUT_TTS_SECS"),
        (StageKind::Lipsync, "LIPSYNC_TIMEOUT_LIPSYNC_SECS"),
        (StageKind::Postprocess, "LIPSYNC_TIMEOUT_POSTPROCESS_SECS"),
    ] {
        if let Some(secs) = env.get(key).and_then(|v| v.parse::<u64>().ok()) {
            timeouts.set(kind, Duration::from_secs(secs));
        }
    }
    timeouts
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn path(&self, key: &str, default: PathBuf) -> PathBuf {
        self.get(key).map(PathBuf::from).unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.bind_address, "0.0.0.0:8000");
        assert_eq!(cfg.max_upload_mb, 50);
        assert!(cfg.enable_swagger);
        assert!(!cfg.log_json);
        assert_eq!(cfg.runtime.concurrency, 1);
        assert_eq!(cfg.runtime.max_text_chars, 200);
        assert_eq!(cfg.runtime.max_audio_video_ratio, 1.5);
        assert_eq!(cfg.runtime.work_root, PathBuf::from("./temp/work"));
        assert_eq!(cfg.tools.output_dir, cfg.output_dir);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config_from(&[
            ("LIPSYNC_CONCURRENCY", "2"),
            ("LIPSYNC_WORKERS", "4"),
            ("LIPSYNC_TIMEOUT_LIPSYNC_SECS", "90"),
            ("LIPSYNC_LOG_JSON", "true"),
            ("LIPSYNC_ENABLE_SWAGGER", "false"),
            ("LIPSYNC_TTS_VOICE", "en-GB-RyanNeural"),
        ]);
        assert_eq!(cfg.runtime.concurrency, 2);
        assert_eq!(cfg.runtime.worker_count(), 4);
        assert_eq!(cfg.runtime.stage_timeouts.lipsync, Duration::from_secs(90));
        assert!(cfg.log_json);
        assert!(!cfg.enable_swagger);
        assert_eq!(cfg.tools.voice, "en-GB-RyanNeural");
    }

    #[test]
    fn unparsable_values_fall_back() {
        let cfg = config_from(&[("LIPSYNC_MAX_UPLOAD_MB", "lots"), ("LIPSYNC_WORKERS", "")]);
        assert_eq!(cfg.max_upload_mb, 50);
        assert_eq!(cfg.runtime.workers, None);
    }
}
