use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::runtime::stage::Stage;
use crate::runtime::types::{Artifact, Artifacts, StageFailure, StageKind};
use crate::services::{ToolConfig, command};

/// Renders the synced video as an optimized GIF in the output directory.
///
/// Two ffmpeg passes (palette generation, then palette use) followed by a
/// lossy `gifsicle` pass when that tool is installed.
#[derive(Debug, Clone)]
pub struct GifEncoder {
    tools: Arc<ToolConfig>,
}

impl GifEncoder {
    pub fn new(tools: Arc<ToolConfig>) -> Self {
        Self { tools }
    }

    fn scale_filter(&self, fps: f64) -> String {
        format!("fps={fps},scale={}:-1:flags=lanczos", self.tools.gif_width)
    }

    /// Output frame rate: the source rate capped at `gif_max_fps`.
    fn fps(&self, artifacts: &Artifacts) -> f64 {
        artifacts
            .video
            .as_ref()
            .map(|v| v.fps)
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(10.0)
            .min(self.tools.gif_max_fps)
    }

    async fn optimize(&self, raw: &Path, target: &Path) -> Result<(), StageFailure> {
        if command::available(&self.tools.gifsicle).await {
            let mut cmd = Command::new(&self.tools.gifsicle);
            cmd.args(["-O3", "--lossy=80"]).arg(raw).arg("-o").arg(target);
            command::run(cmd, "gifsicle optimization").await?;
            remove_quietly(raw).await;
            return Ok(());
        }

        warn!("gifsicle not found; keeping the unoptimized GIF");
        if tokio::fs::rename(raw, target).await.is_err() {
            // Work dir and output dir may sit on different filesystems.
            tokio::fs::copy(raw, target).await.map_err(|e| {
                StageFailure::collaborator(format!(
                    "failed to move GIF to {}: {e}",
                    target.display()
                ))
            })?;
            remove_quietly(raw).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for GifEncoder {
    fn kind(&self) -> StageKind {
        StageKind::Postprocess
    }

    async fn run(&self, artifacts: &Artifacts) -> Result<Artifact, StageFailure> {
        let synced = artifacts.require_synced()?;
        let fps = self.fps(artifacts);

        tokio::fs::create_dir_all(&self.tools.output_dir)
            .await
            .map_err(|e| {
                StageFailure::collaborator(format!(
                    "failed to create output directory {}: {e}",
                    self.tools.output_dir.display()
                ))
            })?;

        let palette = artifacts.work_dir.join("palette.png");
        let raw = artifacts.work_dir.join("raw.gif");
        let target = self
            .tools
            .output_dir
            .join(format!("{}.gif", artifacts.task_id));

        info!(fps, "GIF pass 1: generating palette");
        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(synced)
            .arg("-vf")
            .arg(format!("{},palettegen=stats_mode=diff", self.scale_filter(fps)))
            .arg(&palette);
        command::run(cmd, "GIF palette generation").await?;

        info!("GIF pass 2: rendering with palette");
        let mut cmd = Command::new(&self.tools.ffmpeg);
        cmd.arg("-y")
            .arg("-i")
            .arg(synced)
            .arg("-i")
            .arg(&palette)
            .arg("-lavfi")
            .arg(format!(
                "{} [x]; [x][1:v] paletteuse=dither=bayer:bayer_scale=5:diff_mode=rectangle",
                self.scale_filter(fps)
            ))
            .arg(&raw);
        command::run(cmd, "GIF rendering").await?;

        self.optimize(&raw, &target).await?;
        remove_quietly(&palette).await;

        info!(output = %target.display(), "GIF written");
        Ok(Artifact::Gif(target))
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "failed to remove intermediate file");
    }
}
