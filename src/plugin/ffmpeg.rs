//! FFmpeg encoder: turns a rendered image sequence into a movie file.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{parse_params, PluginError, RenderPlugin, TaskSpec};
use crate::scheduler::job::Job;
use crate::scheduler::task::Task;

pub const NAME: &str = "ffmpeg";

const PRORES_PROFILES: [(&str, u8); 6] = [
    ("proxy", 0),
    ("lt", 1),
    ("standard", 2),
    ("hq", 3),
    ("4444", 4),
    ("4444xq", 5),
];

const PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Libx264,
    Libx265,
    ProresKs,
    Dnxhd,
    Copy,
}

impl Codec {
    fn as_str(self) -> &'static str {
        match self {
            Codec::Libx264 => "libx264",
            Codec::Libx265 => "libx265",
            Codec::ProresKs => "prores_ks",
            Codec::Dnxhd => "dnxhd",
            Codec::Copy => "copy",
        }
    }
}

fn default_crf() -> u8 {
    18
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_frame_rate() -> f64 {
    24.0
}

/// Job parameters understood by [`FfmpegPlugin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FfmpegParams {
    /// printf-style input sequence, e.g. `/out/png/shot_%05d.png`.
    pub input_pattern: String,
    pub output_file: String,
    #[serde(default)]
    pub codec: Codec,
    /// ProRes profile name, required for `prores_ks`.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default)]
    pub start_number: i64,
    #[serde(default)]
    pub pix_fmt: Option<String>,
    /// Number of frames in the input; enables frame-based progress.
    #[serde(default)]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub audio_file: Option<String>,
    #[serde(default)]
    pub ffmpeg_path: Option<String>,
    #[serde(default)]
    pub extra_args: Option<String>,
}

impl FfmpegParams {
    fn prores_profile(&self) -> Option<u8> {
        let profile = self.profile.as_deref()?;
        PRORES_PROFILES
            .iter()
            .find(|(name, _)| *name == profile)
            .map(|(_, id)| *id)
    }
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"frame=\s*(\d+)").unwrap())
}

pub struct FfmpegPlugin {
    executable: String,
}

impl Default for FfmpegPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegPlugin {
    /// Uses `ffmpeg` from `PATH` unless a job overrides `ffmpeg_path`.
    pub fn new() -> Self {
        Self::with_executable("ffmpeg")
    }

    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl RenderPlugin for FfmpegPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn display_name(&self) -> &str {
        "FFmpeg Encoder"
    }

    fn description(&self) -> &str {
        "Encode an image sequence into a video file with FFmpeg"
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), PluginError> {
        let p: FfmpegParams = parse_params(params)?;
        if p.input_pattern.trim().is_empty() {
            return Err(PluginError::invalid("input_pattern is required"));
        }
        if p.output_file.trim().is_empty() {
            return Err(PluginError::invalid("output_file is required"));
        }
        if p.codec == Codec::ProresKs {
            match &p.profile {
                None => return Err(PluginError::invalid("prores_ks requires a profile")),
                Some(profile) if p.prores_profile().is_none() => {
                    return Err(PluginError::invalid(format!(
                        "unknown ProRes profile '{profile}'"
                    )))
                }
                Some(_) => {}
            }
        }
        if p.crf > 51 {
            return Err(PluginError::invalid("crf must be between 0 and 51"));
        }
        if !PRESETS.contains(&p.preset.as_str()) {
            return Err(PluginError::invalid(format!("unknown preset '{}'", p.preset)));
        }
        if !(p.frame_rate.is_finite() && p.frame_rate > 0.0) {
            return Err(PluginError::invalid("frame_rate must be positive"));
        }
        Ok(())
    }

    /// Encoding is not split: one task per job.
    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>, PluginError> {
        let p: FfmpegParams = parse_params(&job.params)?;
        let mut spec = TaskSpec::single();
        if let Some(total) = p.total_frames {
            spec = spec.with_metadata(serde_json::json!({ "total_frames": total }));
        }
        Ok(vec![spec])
    }

    fn build_command(&self, _task: &Task, job: &Job) -> Result<Vec<String>, PluginError> {
        let p: FfmpegParams = parse_params(&job.params)?;
        let executable = p.ffmpeg_path.clone().unwrap_or_else(|| self.executable.clone());

        let mut cmd = vec![
            executable,
            "-y".to_string(),
            "-framerate".to_string(),
            p.frame_rate.to_string(),
            "-start_number".to_string(),
            p.start_number.to_string(),
            "-i".to_string(),
            p.input_pattern.clone(),
        ];
        if let Some(audio) = &p.audio_file {
            cmd.extend(["-i".to_string(), audio.clone()]);
        }

        cmd.extend(["-c:v".to_string(), p.codec.as_str().to_string()]);
        match p.codec {
            Codec::ProresKs => {
                let profile = p
                    .prores_profile()
                    .ok_or_else(|| PluginError::Command("missing ProRes profile".to_string()))?;
                let pix_fmt = if profile >= 4 {
                    p.pix_fmt.clone().unwrap_or_else(|| "yuva444p10le".to_string())
                } else {
                    "yuv422p10le".to_string()
                };
                cmd.extend([
                    "-profile:v".to_string(),
                    profile.to_string(),
                    "-pix_fmt".to_string(),
                    pix_fmt,
                ]);
            }
            Codec::Libx264 | Codec::Libx265 => {
                cmd.extend([
                    "-crf".to_string(),
                    p.crf.to_string(),
                    "-preset".to_string(),
                    p.preset.clone(),
                    "-pix_fmt".to_string(),
                    p.pix_fmt.clone().unwrap_or_else(|| "yuv420p".to_string()),
                ]);
                if p.codec == Codec::Libx264 {
                    cmd.extend(["-movflags".to_string(), "+faststart".to_string()]);
                }
            }
            Codec::Dnxhd | Codec::Copy => {}
        }

        if p.audio_file.is_some() {
            cmd.extend([
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                "192k".to_string(),
            ]);
        } else {
            cmd.push("-an".to_string());
        }

        if let Some(extra) = &p.extra_args {
            cmd.extend(extra.split_whitespace().map(str::to_string));
        }
        cmd.push(p.output_file);
        Ok(cmd)
    }

    fn parse_progress(&self, line: &str, task: &Task) -> Option<f64> {
        if line.contains("video:") && line.contains("audio:") {
            return Some(1.0);
        }
        let total = task.metadata.get("total_frames")?.as_u64()?;
        if total == 0 {
            return None;
        }
        let frame: u64 = frame_re().captures(line)?.get(1)?.as_str().parse().ok()?;
        Some((frame as f64 / total as f64).clamp(0.0, 1.0))
    }
}
