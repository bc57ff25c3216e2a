use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{PipelineStage, StageContext};
use crate::domain::stage::{PipelineArtifacts, StageError};
use crate::infra::process::{run_command, CommandSpec};

const YT_DLP_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

/// ステージが生成する成果物の格納先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSlot {
    Video,
    Audio,
    Subtitles,
    /// output_dir 直下に置かれる完成品
    Output,
}

impl ArtifactSlot {
    fn get(self, artifacts: &PipelineArtifacts) -> Option<&PathBuf> {
        match self {
            Self::Video => artifacts.video_path.as_ref(),
            Self::Audio => artifacts.audio_path.as_ref(),
            Self::Subtitles => artifacts.subtitle_path.as_ref(),
            Self::Output => artifacts.output_path.as_ref(),
        }
    }

    fn set(self, artifacts: &mut PipelineArtifacts, path: PathBuf) {
        match self {
            Self::Video => artifacts.video_path = Some(path),
            Self::Audio => artifacts.audio_path = Some(path),
            Self::Subtitles => artifacts.subtitle_path = Some(path),
            Self::Output => artifacts.output_path = Some(path),
        }
    }
}

/// 外部ツールを1回起動するステージ。
///
/// 引数中の `{url}` `{job_id}` `{workspace}` `{output_dir}` `{video}` `{audio}`
/// `{subtitles}` `{output}` は実行時に置換される。
pub struct CommandStage {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    produces: Option<(ArtifactSlot, String)>,
}

impl CommandStage {
    pub fn new<I, S>(name: impl Into<String>, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            produces: None,
        }
    }

    /// 成功時に `file_name` を成果物として登録する（存在チェックあり）
    pub fn produces(mut self, slot: ArtifactSlot, file_name: impl Into<String>) -> Self {
        self.produces = Some((slot, file_name.into()));
        self
    }

    /// yt-dlp で動画をダウンロードする
    pub fn yt_dlp(binary: impl Into<PathBuf>) -> Self {
        Self::new(
            "download",
            binary,
            ["-f", YT_DLP_FORMAT, "--no-playlist", "-o", "{video}", "{url}"],
        )
        .produces(ArtifactSlot::Video, "{job_id}.mp4")
    }

    /// ffmpeg で ASS 字幕を焼き込む
    pub fn ffmpeg_burn(binary: impl Into<PathBuf>) -> Self {
        Self::new(
            "burn_subtitles",
            binary,
            [
                "-i",
                "{video}",
                "-vf",
                "ass={subtitles}",
                "-c:a",
                "copy",
                "-y",
                "{output}",
            ],
        )
        .produces(ArtifactSlot::Output, "{job_id}_subtitled.mp4")
    }

    fn substitute(
        &self,
        template: &str,
        artifacts: &PipelineArtifacts,
        ctx: &StageContext,
    ) -> Result<String, StageError> {
        let display = |p: &Path| p.to_string_lossy().into_owned();
        // {url} は外部入力なので最後に置換する
        let values = [
            ("{job_id}", Some(ctx.job_id.to_string())),
            ("{workspace}", Some(display(&ctx.workspace))),
            ("{output_dir}", Some(display(&ctx.output_dir))),
            ("{video}", artifacts.video_path.as_deref().map(display)),
            ("{audio}", artifacts.audio_path.as_deref().map(display)),
            ("{subtitles}", artifacts.subtitle_path.as_deref().map(display)),
            ("{output}", artifacts.output_path.as_deref().map(display)),
            ("{url}", Some(artifacts.source_url.clone())),
        ];

        let mut rendered = template.to_string();
        for (key, value) in values {
            if !rendered.contains(key) {
                continue;
            }
            let value = value.ok_or_else(|| {
                StageError::invalid_input(format!(
                    "{}: {key} is required but no earlier stage produced it",
                    self.name
                ))
            })?;
            rendered = rendered.replace(key, &value);
        }
        Ok(rendered)
    }

    fn render_args(
        &self,
        artifacts: &PipelineArtifacts,
        ctx: &StageContext,
    ) -> Result<Vec<String>, StageError> {
        self.args
            .iter()
            .map(|arg| self.substitute(arg, artifacts, ctx))
            .collect()
    }
}

#[async_trait]
impl PipelineStage for CommandStage {
    async fn run(
        &self,
        mut artifacts: PipelineArtifacts,
        ctx: &StageContext,
    ) -> Result<PipelineArtifacts, StageError> {
        if let Some((slot, file_name)) = &self.produces {
            let file_name = self.substitute(file_name, &artifacts, ctx)?;
            let dir = match slot {
                ArtifactSlot::Output => &ctx.output_dir,
                _ => &ctx.workspace,
            };
            slot.set(&mut artifacts, dir.join(file_name));
        }

        let args = self.render_args(&artifacts, ctx)?;
        let spec = CommandSpec::new(&self.program, args, ctx.timeout).current_dir(&ctx.workspace);
        run_command(&spec, &ctx.processes).await?;

        if let Some((slot, _)) = &self.produces {
            if let Some(path) = slot.get(&artifacts) {
                if !path.exists() {
                    return Err(StageError::external_tool(format!(
                        "{} finished but did not produce {}",
                        self.name,
                        path.display()
                    )));
                }
            }
        }

        Ok(artifacts)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
