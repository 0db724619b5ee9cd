//! `ffprobe` JSON parsing and the frame-rate heuristics used for GIF input.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use crate::runtime::types::StageFailure;
use crate::services::command;

/// GIFs commonly report `r_frame_rate = 100/1`; anything above this is
/// treated as bogus.
const MAX_PLAUSIBLE_GIF_FPS: f64 = 50.0;
const FALLBACK_FPS: f64 = 10.0;
const MAX_AVERAGE_FPS: f64 = 30.0;

#[derive(Debug, Default, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeStream {
    pub codec_type: Option<String>,
    pub r_frame_rate: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeFormat {
    pub duration: Option<String>,
}

/// Frame rate, frame count and duration of a normalized video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoProbe {
    pub fps: f64,
    pub frame_count: u64,
    pub duration_secs: f64,
}

impl ProbeOutput {
    pub fn parse(json: &[u8]) -> Result<Self, StageFailure> {
        serde_json::from_slice(json)
            .map_err(|e| StageFailure::collaborator(format!("malformed ffprobe output: {e}")))
    }

    fn video_stream(&self) -> Option<&ProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }
}

/// Parse an ffprobe rational such as `"30000/1001"`.
pub fn parse_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    (num > 0.0 && den > 0.0).then(|| num / den)
}

/// Playback rate to use when converting a GIF.
pub fn gif_fps(probe: &ProbeOutput) -> f64 {
    let Some(stream) = probe.video_stream() else {
        return FALLBACK_FPS;
    };
    if let Some(fps) = stream.r_frame_rate.as_deref().and_then(parse_rate) {
        return if fps > MAX_PLAUSIBLE_GIF_FPS {
            FALLBACK_FPS
        } else {
            fps
        };
    }
    stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .map(|fps| fps.min(MAX_AVERAGE_FPS))
        .unwrap_or(FALLBACK_FPS)
}

pub fn video_info(probe: &ProbeOutput) -> Result<VideoProbe, StageFailure> {
    let stream = probe
        .video_stream()
        .ok_or_else(|| StageFailure::collaborator("no video stream found in file"))?;

    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .unwrap_or(25.0);
    let duration = stream
        .duration
        .as_deref()
        .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.trim().parse::<f64>().ok());
    let frame_count = match (stream.nb_frames.as_deref().and_then(|n| n.parse().ok()), duration) {
        (Some(frames), _) => frames,
        (None, Some(secs)) => (secs * fps) as u64,
        (None, None) => 0,
    };
    let duration_secs = duration.unwrap_or(frame_count as f64 / fps);

    Ok(VideoProbe {
        fps,
        frame_count,
        duration_secs,
    })
}

/// Run `ffprobe` on `path` and parse its stream and format sections.
pub async fn probe(ffprobe: &Path, path: &Path) -> Result<ProbeOutput, StageFailure> {
    let mut cmd = Command::new(ffprobe);
    cmd.args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
        .arg(path);
    let output = command::run(cmd, "ffprobe").await?;
    ProbeOutput::parse(&output.stdout)
}

/// Container duration of `path` in seconds.
pub async fn duration(ffprobe: &Path, path: &Path) -> Result<f64, StageFailure> {
    let probe = probe(ffprobe, path).await?;
    probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| {
            StageFailure::collaborator(format!(
                "ffprobe reported no duration for {}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod test {
    use super::*;

    fn parsed(json: &str) -> ProbeOutput {
        ProbeOutput::parse(json.as_bytes()).expect("valid probe json")
    }

    #[test]
    fn parses_rationals() {
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn bogus_gif_rate_falls_back_to_ten() {
        let probe = parsed(r#"{"streams":[{"codec_type":"video","r_frame_rate":"100/1"}]}"#);
        assert_eq!(gif_fps(&probe), 10.0);
    }

    #[test]
    fn plausible_gif_rate_is_kept() {
        let probe = parsed(r#"{"streams":[{"codec_type":"video","r_frame_rate":"25/2"}]}"#);
        assert_eq!(gif_fps(&probe), 12.5);
    }

    #[test]
    fn average_rate_is_capped() {
        let probe = parsed(
            r#"{"streams":[{"codec_type":"video","r_frame_rate":"0/0","avg_frame_rate":"60/1"}]}"#,
        );
        assert_eq!(gif_fps(&probe), 30.0);
        assert_eq!(gif_fps(&parsed(r#"{"streams":[]}"#)), 10.0);
    }

    #[test]
    fn video_info_prefers_frame_count_and_stream_duration() {
        let probe = parsed(
            r#"{"streams":[
                {"codec_type":"audio","duration":"9.0"},
                {"codec_type":"video","r_frame_rate":"10/1","nb_frames":"30","duration":"3.0"}
            ]}"#,
        );
        let info = video_info(&probe).unwrap();
        assert_eq!(info.fps, 10.0);
        assert_eq!(info.frame_count, 30);
        assert_eq!(info.duration_secs, 3.0);
    }

    #[test]
    fn video_info_falls_back_to_format_duration() {
        let probe = parsed(
            r#"{"streams":[{"codec_type":"video","r_frame_rate":"20/1"}],
                "format":{"duration":"2.5"}}"#,
        );
        let info = video_info(&probe).unwrap();
        assert_eq!(info.frame_count, 50);
        assert_eq!(info.duration_secs, 2.5);
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let probe = parsed(r#"{"streams":[{"codec_type":"audio"}]}"#);
        assert!(video_info(&probe).is_err());
        assert!(ProbeOutput::parse(b"not json").is_err());
    }
}
