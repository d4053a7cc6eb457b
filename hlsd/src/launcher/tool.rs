//! The external segmenting tool.

use std::path::PathBuf;

use serde::Serialize;

use super::process::{PipelineProcess, PipelineStage};
use super::strategy::PipelineStrategy;
use crate::Result;
use crate::artifacts::{PLAYLIST_NAME, ResumePoint, SEGMENT_TEMPLATE};
use crate::config::OrchestratorConfig;

/// Everything a tool needs to start one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub session_id: String,
    /// Session artifact directory; chunks and manifest are written here.
    pub working_dir: PathBuf,
    /// Direct stream URL of the content.
    pub source_url: String,
    pub strategy: PipelineStrategy,
    pub resume: Option<ResumePoint>,
}

/// Starts pipelines that turn a source URL into chunks and a manifest.
pub trait PipelineTool: Send + Sync {
    fn spawn(&self, request: &PipelineRequest) -> Result<PipelineProcess>;
}

/// Availability of the external binaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    pub ffmpeg: bool,
    pub ffprobe: bool,
    pub mpv: bool,
}

impl DependencyStatus {
    /// Run each configured binary once to see whether it is usable.
    pub fn detect(config: &OrchestratorConfig) -> Self {
        Self {
            ffmpeg: detect_version(&config.ffmpeg_path, "-version").is_some(),
            ffprobe: detect_version(&config.ffprobe_path, "-version").is_some(),
            mpv: detect_version(&config.mpv_path, "--version").is_some(),
        }
    }

    pub fn all_available(&self) -> bool {
        self.ffmpeg && self.ffprobe && self.mpv
    }
}

/// First line of `<path> <flag>` output, if the binary runs.
pub fn detect_version(path: &str, flag: &str) -> Option<String> {
    process_utils::std_command(path)
        .arg(flag)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|s| s.lines().next().map(|l| l.to_string()))
        })
}

/// ffmpeg HLS segmenter, fed by mpv when the source needs transcoding.
#[derive(Debug, Clone)]
pub struct HlsPipelineTool {
    ffmpeg_path: String,
    mpv_path: String,
    segment_secs: u32,
}

impl HlsPipelineTool {
    pub fn new(ffmpeg_path: impl Into<String>, mpv_path: impl Into<String>, segment_secs: u32) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            mpv_path: mpv_path.into(),
            segment_secs,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(&config.ffmpeg_path, &config.mpv_path, config.hls_segment_secs)
    }

    /// Decoder arguments for a transcoding pipeline.
    pub fn decoder_args(&self, request: &PipelineRequest) -> Vec<String> {
        [
            request.source_url.as_str(),
            "--no-terminal",
            "--o=-",
            "--of=mpegts",
            "--oac=aac",
            "--ovc=libx264",
            "--ovcopts=preset=ultrafast",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    /// Segmenter arguments. Reads stdin when transcoding.
    pub fn segmenter_args(&self, request: &PipelineRequest) -> Vec<String> {
        let mut args = vec!["-hide_banner".to_string(), "-nostdin".to_string()];

        match request.strategy {
            PipelineStrategy::Remux => {
                args.extend(["-i".to_string(), request.source_url.clone()]);
            }
            PipelineStrategy::Transcode => {
                // -nostdin only disables interaction; "-i -" still reads the pipe.
                args.extend(["-fflags", "+genpts", "-i", "-"].map(String::from));
            }
        }

        args.extend(["-map", "0", "-c", "copy", "-f", "hls"].map(String::from));
        args.extend([
            "-hls_time".to_string(),
            self.segment_secs.to_string(),
            "-hls_playlist_type".to_string(),
            "event".to_string(),
        ]);

        if let Some(resume) = &request.resume {
            args.extend([
                "-hls_start_number".to_string(),
                resume.chunk_index.to_string(),
                "-hls_flags".to_string(),
                "append_list".to_string(),
            ]);
        }

        args.extend([
            "-hls_segment_filename".to_string(),
            SEGMENT_TEMPLATE.to_string(),
            PLAYLIST_NAME.to_string(),
        ]);
        args
    }

    fn stage(&self, label: &str, program: &str, args: Vec<String>, request: &PipelineRequest) -> PipelineStage {
        let mut command = process_utils::tokio_command(program);
        command.args(args).current_dir(&request.working_dir);
        PipelineStage::new(label, command)
    }
}

impl PipelineTool for HlsPipelineTool {
    fn spawn(&self, request: &PipelineRequest) -> Result<PipelineProcess> {
        let segmenter = self.stage("ffmpeg", &self.ffmpeg_path, self.segmenter_args(request), request);
        let stages = match request.strategy {
            PipelineStrategy::Remux => vec![segmenter],
            PipelineStrategy::Transcode => {
                let decoder = self.stage("mpv", &self.mpv_path, self.decoder_args(request), request);
                vec![decoder, segmenter]
            }
        };
        PipelineProcess::spawn_chain(&request.session_id, stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(strategy: PipelineStrategy, resume: Option<ResumePoint>) -> PipelineRequest {
        PipelineRequest {
            session_id: "s1".to_string(),
            working_dir: PathBuf::from("/tmp/streams/s1"),
            source_url: "http://localhost:3000/stream?url=magnet&index=0".to_string(),
            strategy,
            resume,
        }
    }

    fn tool() -> HlsPipelineTool {
        HlsPipelineTool::new("ffmpeg", "mpv", 4)
    }

    fn position(args: &[String], flag: &str) -> Option<usize> {
        args.iter().position(|a| a == flag)
    }

    #[test]
    fn test_remux_reads_source_directly() {
        let req = request(PipelineStrategy::Remux, None);
        let args = tool().segmenter_args(&req);

        let input = position(&args, "-i").unwrap();
        assert_eq!(args[input + 1], req.source_url);
        assert_eq!(args[position(&args, "-c").unwrap() + 1], "copy");
        assert_eq!(args[position(&args, "-hls_time").unwrap() + 1], "4");
        assert_eq!(args[position(&args, "-hls_playlist_type").unwrap() + 1], "event");
        assert!(position(&args, "-hls_start_number").is_none());
        assert_eq!(args.last().map(String::as_str), Some(PLAYLIST_NAME));
    }

    #[test]
    fn test_transcode_reads_stdin() {
        let req = request(PipelineStrategy::Transcode, None);
        let args = tool().segmenter_args(&req);

        assert_eq!(args[position(&args, "-i").unwrap() + 1], "-");
        assert_eq!(args[position(&args, "-fflags").unwrap() + 1], "+genpts");

        let decoder = tool().decoder_args(&req);
        assert_eq!(decoder[0], req.source_url);
        assert!(decoder.contains(&"--of=mpegts".to_string()));
        assert!(decoder.contains(&"--o=-".to_string()));
    }

    #[test]
    fn test_resume_appends_to_manifest() {
        let resume = ResumePoint {
            byte_offset: 1_400_000,
            chunk_index: 7,
        };
        let args = tool().segmenter_args(&request(PipelineStrategy::Transcode, Some(resume)));

        assert_eq!(args[position(&args, "-hls_start_number").unwrap() + 1], "7");
        assert_eq!(args[position(&args, "-hls_flags").unwrap() + 1], "append_list");
        assert_eq!(args[position(&args, "-hls_segment_filename").unwrap() + 1], SEGMENT_TEMPLATE);
    }

    #[test]
    fn test_detect_version_for_missing_binary() {
        assert!(detect_version("/nonexistent/ffmpeg", "-version").is_none());
    }

    #[test]
    fn test_dependency_status_with_missing_binaries() {
        let config = OrchestratorConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            mpv_path: "/nonexistent/mpv".to_string(),
            ..Default::default()
        };
        let status = DependencyStatus::detect(&config);
        assert_eq!(status, DependencyStatus::default());
        assert!(!status.all_available());
    }
}
