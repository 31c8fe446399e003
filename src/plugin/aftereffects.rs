//! Adobe After Effects via `aerender`.
//!
//! Two modes:
//! - `custom`: render one composition as a PNG sequence, split into frame
//!   chunks, optionally followed by FFmpeg encode jobs (ProRes 4444, MP4).
//! - `render_queue`: render items of the project's own render queue, one task
//!   per item.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ffmpeg, parse_params, PluginError, RenderPlugin, TaskSpec};
use crate::scheduler::job::{Job, JobSubmission};
use crate::scheduler::task::Task;

pub const NAME: &str = "aftereffects";

pub const DEFAULT_CHUNK_SIZE: i64 = 50;
/// Upper bound on the tasks one job may expand into.
pub const MAX_TASKS_PER_JOB: i64 = 10_000;
const PNG_OUTPUT_MODULE: &str = "PNG Sequence";
const RENDER_SETTINGS: &str = "Best Settings";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Custom,
    RenderQueue,
}

/// One render-queue entry, with the frame information the submitter knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderQueueItem {
    pub index: u32,
    #[serde(default)]
    pub comp_name: Option<String>,
    #[serde(default)]
    pub frame_start: Option<i64>,
    #[serde(default)]
    pub frame_end: Option<i64>,
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Prores4444,
    Mp4,
}

impl std::str::FromStr for OutputFormat {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "prores4444" => Ok(OutputFormat::Prores4444),
            "mp4" => Ok(OutputFormat::Mp4),
            other => Err(PluginError::invalid(format!("unknown output format '{other}'"))),
        }
    }
}

/// `"png,mp4"` or `["png", "mp4"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatList {
    Csv(String),
    List(Vec<String>),
}

impl Default for FormatList {
    fn default() -> Self {
        FormatList::List(vec!["png".to_string()])
    }
}

impl FormatList {
    pub fn parse(&self) -> Result<Vec<OutputFormat>, PluginError> {
        let items: Vec<&str> = match self {
            FormatList::Csv(s) => s.split(',').filter(|f| !f.trim().is_empty()).collect(),
            FormatList::List(v) => v.iter().map(String::as_str).collect(),
        };
        items.into_iter().map(str::parse::<OutputFormat>).collect()
    }
}

fn default_frame_end() -> i64 {
    100
}

fn default_frame_rate() -> f64 {
    24.0
}

/// Job parameters understood by [`AfterEffectsPlugin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterEffectsParams {
    #[serde(default)]
    pub mode: RenderMode,
    pub project_path: String,
    #[serde(default)]
    pub comp_name: Option<String>,
    /// Output directory; PNGs go to `<output_path>/png`.
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_formats: FormatList,
    #[serde(default)]
    pub frame_start: i64,
    #[serde(default = "default_frame_end")]
    pub frame_end: i64,
    /// Frames per task; 0 picks a default.
    #[serde(default)]
    pub chunk_size: i64,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default)]
    pub rq_items: Vec<RenderQueueItem>,
    #[serde(default)]
    pub rq_indices: Vec<u32>,
    #[serde(default)]
    pub aerender_path: Option<String>,
}

impl AfterEffectsParams {
    fn total_frames(&self) -> Result<i64, PluginError> {
        self.frame_end
            .checked_sub(self.frame_start)
            .and_then(|span| span.checked_add(1))
            .ok_or_else(|| PluginError::invalid("frame range is too large"))
    }

    fn chunk_len(&self) -> Result<i64, PluginError> {
        let total = self.total_frames()?;
        Ok(if self.chunk_size > 0 {
            self.chunk_size.min(total)
        } else {
            DEFAULT_CHUNK_SIZE.min(total)
        })
    }

    /// Split `frame_start..=frame_end` into inclusive chunk ranges.
    fn chunks(&self) -> Result<Vec<(i64, i64)>, PluginError> {
        if self.frame_start > self.frame_end {
            return Err(PluginError::invalid("frame_start is after frame_end"));
        }
        let total = self.total_frames()?;
        let chunk = self.chunk_len()?;
        let count = total / chunk + i64::from(total % chunk != 0);
        if count > MAX_TASKS_PER_JOB {
            return Err(PluginError::invalid(format!(
                "{total} frames in chunks of {chunk} is {count} tasks, more than {MAX_TASKS_PER_JOB}"
            )));
        }

        let mut ranges = Vec::with_capacity(count as usize);
        let mut start = self.frame_start;
        loop {
            let end = start.saturating_add(chunk - 1).min(self.frame_end);
            ranges.push((start, end));
            match end.checked_add(1) {
                Some(next) if next <= self.frame_end => start = next,
                _ => break,
            }
        }
        Ok(ranges)
    }

    fn safe_comp_name(&self) -> String {
        self.comp_name
            .as_deref()
            .unwrap_or_default()
            .chars()
            .map(|c| match c {
                '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
                c => c,
            })
            .collect()
    }

    fn output_dir(&self) -> &Path {
        Path::new(self.output_path.as_deref().unwrap_or_default())
    }

    /// Where aerender writes frames; `[#####]` is its frame-number placeholder.
    fn png_output(&self) -> String {
        self.output_dir()
            .join("png")
            .join(format!("{}_[#####].png", self.safe_comp_name()))
            .to_string_lossy()
            .into_owned()
    }

    /// The same sequence, in FFmpeg's printf notation.
    fn png_pattern(&self) -> String {
        self.output_dir()
            .join("png")
            .join(format!("{}_%05d.png", self.safe_comp_name()))
            .to_string_lossy()
            .into_owned()
    }
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"PROGRESS:.*\((\d+)\)").unwrap())
}

pub struct AfterEffectsPlugin {
    executable: String,
}

impl Default for AfterEffectsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl AfterEffectsPlugin {
    /// Uses `aerender` from `PATH` unless a job overrides `aerender_path`.
    pub fn new() -> Self {
        Self::with_executable("aerender")
    }

    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn executable_for(&self, params: &AfterEffectsParams) -> String {
        params
            .aerender_path
            .clone()
            .unwrap_or_else(|| self.executable.clone())
    }

    fn encode_job(job: &Job, label: &str, params: serde_json::Value) -> JobSubmission {
        JobSubmission::new(format!("{} - {label}", job.name), ffmpeg::NAME, params)
            .with_priority(job.priority)
            .with_pool(job.pool.clone())
            .with_dependency(job.id)
    }
}

impl RenderPlugin for AfterEffectsPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn display_name(&self) -> &str {
        "Adobe After Effects"
    }

    fn description(&self) -> &str {
        "Render After Effects projects with aerender, by composition or render queue"
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), PluginError> {
        let p: AfterEffectsParams = parse_params(params)?;
        if p.project_path.trim().is_empty() {
            return Err(PluginError::invalid("project_path is required"));
        }
        match p.mode {
            RenderMode::RenderQueue => {
                if p.rq_items.is_empty() && p.rq_indices.is_empty() {
                    return Err(PluginError::invalid(
                        "render_queue mode needs rq_items or rq_indices",
                    ));
                }
                if p.rq_items.len().max(p.rq_indices.len()) as i64 > MAX_TASKS_PER_JOB {
                    return Err(PluginError::invalid(format!(
                        "more than {MAX_TASKS_PER_JOB} render queue items"
                    )));
                }
                for item in &p.rq_items {
                    if let (Some(start), Some(end)) = (item.frame_start, item.frame_end) {
                        if start > end {
                            return Err(PluginError::invalid(format!(
                                "render queue item {}: frame_start is after frame_end",
                                item.index
                            )));
                        }
                    }
                }
            }
            RenderMode::Custom => {
                if p.comp_name.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(PluginError::invalid("comp_name is required"));
                }
                if p.output_path.as_deref().is_none_or(|o| o.trim().is_empty()) {
                    return Err(PluginError::invalid("output_path is required"));
                }
                if p.chunk_size < 0 {
                    return Err(PluginError::invalid("chunk_size must not be negative"));
                }
                p.chunks()?;
                p.output_formats.parse()?;
            }
        }
        Ok(())
    }

    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>, PluginError> {
        let p: AfterEffectsParams = parse_params(&job.params)?;
        match p.mode {
            RenderMode::RenderQueue if !p.rq_items.is_empty() => Ok(p
                .rq_items
                .iter()
                .map(|item| TaskSpec {
                    frame_start: item.frame_start,
                    frame_end: item.frame_end,
                    metadata: serde_json::json!({
                        "rq_index": item.index,
                        "comp_name": item.comp_name,
                        "output_path": item.output_path,
                    }),
                })
                .collect()),
            RenderMode::RenderQueue => Ok(p
                .rq_indices
                .iter()
                .map(|index| TaskSpec::single().with_metadata(serde_json::json!({ "rq_index": index })))
                .collect()),
            RenderMode::Custom => Ok(p
                .chunks()?
                .into_iter()
                .map(|(start, end)| {
                    TaskSpec::frames(start, end)
                        .with_metadata(serde_json::json!({ "task_type": "render_png" }))
                })
                .collect()),
        }
    }

    fn build_command(&self, task: &Task, job: &Job) -> Result<Vec<String>, PluginError> {
        let p: AfterEffectsParams = parse_params(&job.params)?;
        let mut cmd = vec![
            self.executable_for(&p),
            "-project".to_string(),
            p.project_path.clone(),
        ];
        match p.mode {
            RenderMode::RenderQueue => {
                let rq_index = task
                    .metadata
                    .get("rq_index")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1);
                cmd.extend(["-rqindex".to_string(), rq_index.to_string()]);
                cmd.extend(
                    ["-v", "ERRORS_AND_PROGRESS", "-sound", "OFF", "-mp"].map(String::from),
                );
            }
            RenderMode::Custom => {
                let comp = p
                    .comp_name
                    .clone()
                    .ok_or_else(|| PluginError::Command("comp_name is missing".to_string()))?;
                cmd.extend(["-comp".to_string(), comp, "-output".to_string(), p.png_output()]);
                cmd.extend(
                    ["-v", "ERRORS_AND_PROGRESS", "-sound", "OFF", "-mp"].map(String::from),
                );
                cmd.extend([
                    "-OMtemplate".to_string(),
                    PNG_OUTPUT_MODULE.to_string(),
                    "-RStemplate".to_string(),
                    RENDER_SETTINGS.to_string(),
                ]);
                if let Some(start) = task.frame_start {
                    cmd.extend(["-s".to_string(), start.to_string()]);
                }
                if let Some(end) = task.frame_end {
                    cmd.extend(["-e".to_string(), end.to_string()]);
                }
            }
        }
        Ok(cmd)
    }

    /// aerender prints `PROGRESS:  0:00:01:15 (101): 0 Seconds`, where the
    /// number in parentheses is the frame being rendered.
    fn parse_progress(&self, line: &str, task: &Task) -> Option<f64> {
        if let Some(caps) = progress_re().captures(line) {
            let frame: i64 = caps.get(1)?.as_str().parse().ok()?;
            let (start, end) = (task.frame_start?, task.frame_end?);
            let total = end.checked_sub(start)?.checked_add(1)?;
            if total <= 0 {
                return None;
            }
            let done = (frame.saturating_sub(start) as f64 + 1.0) / total as f64;
            return Some(done.clamp(0.0, 1.0));
        }
        if line.contains("PROGRESS: Total Time Elapsed") {
            return Some(1.0);
        }
        None
    }

    fn follow_up_jobs(&self, job: &Job) -> Vec<JobSubmission> {
        let Ok(p) = parse_params::<AfterEffectsParams>(&job.params) else {
            return Vec::new();
        };
        if p.mode != RenderMode::Custom {
            return Vec::new();
        }
        let formats = p.output_formats.parse().unwrap_or_default();
        let total_frames = p.total_frames().ok();
        let name = p.safe_comp_name();
        let input = p.png_pattern();

        formats
            .into_iter()
            .filter_map(|format| match format {
                OutputFormat::Png => None,
                OutputFormat::Prores4444 => Some(Self::encode_job(
                    job,
                    "ProRes 4444",
                    serde_json::json!({
                        "input_pattern": input,
                        "output_file": p.output_dir().join("prores").join(format!("{name}.mov")).to_string_lossy(),
                        "codec": "prores_ks",
                        "profile": "4444",
                        "frame_rate": p.frame_rate,
                        "start_number": p.frame_start,
                        "pix_fmt": "yuva444p10le",
                        "total_frames": total_frames,
                    }),
                )),
                OutputFormat::Mp4 => Some(Self::encode_job(
                    job,
                    "MP4",
                    serde_json::json!({
                        "input_pattern": input,
                        "output_file": p.output_dir().join("mp4").join(format!("{name}.mp4")).to_string_lossy(),
                        "codec": "libx264",
                        "crf": 18,
                        "preset": "medium",
                        "frame_rate": p.frame_rate,
                        "start_number": p.frame_start,
                        "pix_fmt": "yuv420p",
                        "total_frames": total_frames,
                    }),
                )),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn custom_params() -> serde_json::Value {
        json!({
            "project_path": "/projects/shot010.aep",
            "comp_name": "Main/Comp",
            "output_path": "/renders/shot010",
            "frame_start": 1,
            "frame_end": 120,
        })
    }

    fn job(params: serde_json::Value) -> Job {
        Job::new(JobSubmission::new("shot010", NAME, params))
    }

    #[test]
    fn validate_custom_mode() {
        let plugin = AfterEffectsPlugin::new();
        assert!(plugin.validate(&custom_params()).is_ok());

        let mut p = custom_params();
        p["comp_name"] = json!("");
        assert!(plugin.validate(&p).is_err());

        let mut p = custom_params();
        p["frame_start"] = json!(200);
        assert!(plugin.validate(&p).is_err());

        let mut p = custom_params();
        p["output_formats"] = json!("png,gif");
        assert!(plugin.validate(&p).is_err());

        assert!(plugin.validate(&json!({"comp_name": "x"})).is_err());
    }

    #[test]
    fn validate_render_queue_mode() {
        let plugin = AfterEffectsPlugin::new();
        let params = json!({"mode": "render_queue", "project_path": "/p.aep"});
        assert!(plugin.validate(&params).is_err());
        let params = json!({"mode": "render_queue", "project_path": "/p.aep", "rq_indices": [1, 3]});
        assert!(plugin.validate(&params).is_ok());
    }

    #[test]
    fn custom_mode_chunks_frames() {
        let plugin = AfterEffectsPlugin::new();
        let specs = plugin.create_tasks(&job(custom_params())).unwrap();
        let ranges: Vec<_> = specs
            .iter()
            .map(|s| (s.frame_start.unwrap(), s.frame_end.unwrap()))
            .collect();
        assert_eq!(ranges, vec![(1, 50), (51, 100), (101, 120)]);

        let mut p = custom_params();
        p["chunk_size"] = json!(40);
        assert_eq!(plugin.create_tasks(&job(p)).unwrap().len(), 3);
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        let plugin = AfterEffectsPlugin::new();

        let mut p = custom_params();
        p["frame_start"] = json!(0);
        p["frame_end"] = json!(i64::MAX);
        p["chunk_size"] = json!(i64::MAX);
        assert!(matches!(plugin.validate(&p), Err(PluginError::InvalidParams(_))));
        assert!(matches!(
            plugin.create_tasks(&job(p)),
            Err(PluginError::InvalidParams(_))
        ));

        let mut p = custom_params();
        p["frame_start"] = json!(i64::MIN);
        p["frame_end"] = json!(i64::MAX);
        assert!(plugin.validate(&p).is_err());

        let mut p = custom_params();
        p["frame_start"] = json!(0);
        p["frame_end"] = json!(100_000_000);
        p["chunk_size"] = json!(1);
        let err = plugin.validate(&p).unwrap_err();
        assert!(err.to_string().contains("more than 10000"), "{err}");
    }

    #[test]
    fn chunking_near_the_top_of_the_range() {
        let plugin = AfterEffectsPlugin::new();
        let mut p = custom_params();
        p["frame_start"] = json!(i64::MAX - 99);
        p["frame_end"] = json!(i64::MAX);
        let specs = plugin.create_tasks(&job(p)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].frame_start, Some(i64::MAX - 49));
        assert_eq!(specs[1].frame_end, Some(i64::MAX));
    }

    #[test]
    fn maximum_task_count_is_accepted() {
        let plugin = AfterEffectsPlugin::new();
        let mut p = custom_params();
        p["frame_start"] = json!(1);
        p["frame_end"] = json!(MAX_TASKS_PER_JOB);
        p["chunk_size"] = json!(1);
        assert!(plugin.validate(&p).is_ok());
        assert_eq!(
            plugin.create_tasks(&job(p)).unwrap().len(),
            MAX_TASKS_PER_JOB as usize
        );
    }

    #[test]
    fn short_range_is_a_single_chunk() {
        let plugin = AfterEffectsPlugin::new();
        let mut p = custom_params();
        p["frame_end"] = json!(10);
        let specs = plugin.create_tasks(&job(p)).unwrap();
        assert_eq!(specs, vec![TaskSpec::frames(1, 10).with_metadata(json!({"task_type": "render_png"}))]);
    }

    #[test]
    fn render_queue_mode_one_task_per_item() {
        let plugin = AfterEffectsPlugin::new();
        let job = job(json!({
            "mode": "render_queue",
            "project_path": "/p.aep",
            "rq_items": [
                {"index": 1, "comp_name": "A", "frame_start": 0, "frame_end": 99},
                {"index": 4, "comp_name": "B"},
            ],
        }));
        let specs = plugin.create_tasks(&job).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].frame_end, Some(99));
        assert_eq!(specs[1].metadata["rq_index"], 4);

        let task = Task::from_spec(job.id, 1, specs[1].clone(), Utc::now());
        let cmd = plugin.build_command(&task, &job).unwrap();
        assert_eq!(&cmd[..5], ["aerender", "-project", "/p.aep", "-rqindex", "4"]);
    }

    #[test]
    fn custom_command_has_frame_range_and_png_output() {
        let plugin = AfterEffectsPlugin::new();
        let job = job(custom_params());
        let task = Task::from_spec(job.id, 1, TaskSpec::frames(51, 100), Utc::now());
        let cmd = plugin.build_command(&task, &job).unwrap();
        let joined = cmd.join(" ");
        assert!(joined.contains("-comp Main/Comp"));
        assert!(joined.contains("Main_Comp_[#####].png"));
        assert!(joined.contains("-OMtemplate PNG Sequence"));
        assert!(joined.ends_with("-s 51 -e 100"));
    }

    #[test]
    fn parses_frame_progress_within_chunk() {
        let plugin = AfterEffectsPlugin::new();
        let task = Task::from_spec(uuid::Uuid::new_v4(), 1, TaskSpec::frames(51, 100), Utc::now());

        let p = plugin
            .parse_progress("PROGRESS:  0:00:03:00 (75): 0 Seconds", &task)
            .unwrap();
        assert!((p - 0.5).abs() < 1e-9);
        assert_eq!(
            plugin.parse_progress("PROGRESS:  0:00:00:01 (300): 0 Seconds", &task),
            Some(1.0)
        );
        assert_eq!(
            plugin.parse_progress("PROGRESS: Total Time Elapsed: 2 Min", &task),
            Some(1.0)
        );
        assert_eq!(plugin.parse_progress("aerender version 24.0", &task), None);
    }

    #[test]
    fn follow_up_encode_jobs() {
        let plugin = AfterEffectsPlugin::new();
        let mut p = custom_params();
        p["output_formats"] = json!("png, prores4444, mp4");
        let job = job(p);

        let follow_ups = plugin.follow_up_jobs(&job);
        assert_eq!(follow_ups.len(), 2);
        assert_eq!(follow_ups[0].name, "shot010 - ProRes 4444");
        assert_eq!(follow_ups[0].plugin_type, ffmpeg::NAME);
        assert_eq!(follow_ups[0].depends_on, vec![job.id]);
        assert_eq!(follow_ups[0].params["profile"], "4444");
        assert_eq!(follow_ups[0].params["total_frames"], 120);
        assert_eq!(follow_ups[1].name, "shot010 - MP4");
        assert_eq!(follow_ups[1].params["start_number"], 1);

        let ffmpeg = ffmpeg::FfmpegPlugin::new();
        for submission in &follow_ups {
            assert!(ffmpeg.validate(&submission.params).is_ok());
        }
    }

    #[test]
    fn png_only_has_no_follow_ups() {
        let plugin = AfterEffectsPlugin::new();
        assert!(plugin.follow_up_jobs(&job(custom_params())).is_empty());
    }
}
