//! FFmpeg segment exporter: ffprobe for durations, concat filter for export

use super::{ExportQuality, MergeError, MergePlan, MergeResult, SegmentExporter};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FfmpegExporter {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    quality: ExportQuality,
    audio_bitrate: u32,
}

impl FfmpegExporter {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            quality: ExportQuality::default(),
            audio_bitrate: 128_000,
        }
    }

    pub fn with_quality(mut self, quality: ExportQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_audio_bitrate(mut self, bitrate: u32) -> Self {
        self.audio_bitrate = bitrate;
        self
    }

    fn args(&self, plan: &MergePlan, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-nostats".to_string(),
        ];
        for entry in &plan.entries {
            args.extend(["-i".to_string(), entry.path.to_string_lossy().to_string()]);
        }

        args.extend([
            "-filter_complex".to_string(),
            build_concat_filter(plan),
            "-map".to_string(),
            "[v]".to_string(),
            "-map".to_string(),
            "[a]".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.quality.h264_preset().to_string(),
            "-crf".to_string(),
            self.quality.crf().to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.audio_bitrate.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }
}

/// Build the filter graph that places every segment at its offset
///
/// Each segment's audio is resampled onto its own timeline, padded and cut
/// to the container duration, so audio and video of a segment start
/// together and the next segment starts exactly at the sum of durations.
pub fn build_concat_filter(plan: &MergePlan) -> String {
    let mut filters = Vec::with_capacity(plan.len() + 1);
    let mut concat_inputs = String::new();

    for (i, entry) in plan.entries.iter().enumerate() {
        let secs = entry.duration.as_secs_f64();
        filters.push(format!("[{i}:v]setpts=PTS-STARTPTS[v{i}]"));
        filters.push(format!(
            "[{i}:a]aresample=async=1,apad,atrim=0:{secs:.6},asetpts=PTS-STARTPTS[a{i}]"
        ));
        concat_inputs.push_str(&format!("[v{i}][a{i}]"));
    }

    filters.push(format!(
        "{}concat=n={}:v=1:a=1[v][a]",
        concat_inputs,
        plan.len()
    ));
    filters.join(";")
}

fn parse_duration(stdout: &str) -> Option<Duration> {
    let secs: f64 = stdout.trim().lines().next()?.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

impl SegmentExporter for FfmpegExporter {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn probe_duration(&self, path: &Path) -> MergeResult<Duration> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| MergeError::Probe {
                path: path.to_path_buf(),
                message: format!("Failed to run ffprobe: {}", e),
            })?;

        if !output.status.success() {
            return Err(MergeError::Probe {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_duration(&stdout).ok_or_else(|| MergeError::Probe {
            path: path.to_path_buf(),
            message: format!("Unexpected ffprobe output: {}", stdout.trim()),
        })
    }

    fn export(&self, plan: &MergePlan, output: &Path) -> MergeResult<()> {
        let args = self.args(plan, output);
        tracing::info!("Starting FFmpeg merge: {:?}", args);

        let result = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| MergeError::Export(format!("Failed to start FFmpeg: {}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(MergeError::Export(format!(
                "FFmpeg exited with error: {}",
                stderr
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioSample, CameraFacing, VideoFrame};
    use crate::encoder::ffmpeg::tool_available;
    use crate::encoder::{EncoderSession, EncoderSettings, FfmpegMuxer};
    use crate::merger::SegmentMerger;
    use std::sync::Arc;

    #[test]
    fn test_concat_filter() {
        let plan = MergePlan::new(vec![
            (PathBuf::from("a.mp4"), Duration::from_millis(1000)),
            (PathBuf::from("b.mp4"), Duration::from_millis(1500)),
        ]);
        let filter = build_concat_filter(&plan);
        assert_eq!(
            filter,
            "[0:v]setpts=PTS-STARTPTS[v0];\
             [0:a]aresample=async=1,apad,atrim=0:1.000000,asetpts=PTS-STARTPTS[a0];\
             [1:v]setpts=PTS-STARTPTS[v1];\
             [1:a]aresample=async=1,apad,atrim=0:1.500000,asetpts=PTS-STARTPTS[a1];\
             [v0][a0][v1][a1]concat=n=2:v=1:a=1[v][a]"
        );
    }

    #[test]
    fn test_args_use_quality_preset() {
        let exporter = FfmpegExporter::new("ffmpeg", "ffprobe").with_quality(ExportQuality::Lossless);
        let plan = MergePlan::new(vec![
            (PathBuf::from("a.mp4"), Duration::from_secs(1)),
            (PathBuf::from("b.mp4"), Duration::from_secs(1)),
        ]);
        let args = exporter.args(&plan, Path::new("out.mp4")).join(" ");
        assert!(args.contains("-i a.mp4 -i b.mp4"));
        assert!(args.contains("-preset veryslow -crf 1"));
        assert!(args.ends_with("out.mp4"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3.000000\n"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration(""), None);
    }

    /// Record a flat `level` gray picture with `audio_secs` of silence
    async fn record(path: PathBuf, video_secs: f64, audio_secs: f64, level: u8) -> PathBuf {
        let mut session = EncoderSession::new(
            path,
            EncoderSettings {
                track_queue_capacity: 256,
                ..Default::default()
            },
            Arc::new(FfmpegMuxer::new("ffmpeg")),
        );
        let chunks = (video_secs.max(audio_secs) * 30.0).round() as u64;
        for i in 0..chunks {
            let secs = i as f64 / 30.0;
            let pts = Duration::from_secs_f64(secs);
            if secs < video_secs {
                let pixels = vec![level; 64 * 48 * 4];
                session.append_video(&VideoFrame::new(pixels, 64, 48, pts, CameraFacing::Back));
            }
            if secs < audio_secs {
                session.append_audio(&AudioSample::new(vec![0; 1470 * 2], pts, 44_100, 2));
            }
        }
        session.finish().await.unwrap()
    }

    /// Mean luma of the frame shown at `secs`
    fn luma_at(path: &Path, secs: f64) -> f64 {
        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-ss", &format!("{secs:.3}"), "-i"])
            .arg(path)
            .args(["-frames:v", "1", "-f", "rawvideo", "-pix_fmt", "gray", "-"])
            .output()
            .unwrap();
        assert!(output.status.success() && !output.stdout.is_empty());
        output.stdout.iter().map(|&y| y as f64).sum::<f64>() / output.stdout.len() as f64
    }

    #[tokio::test]
    async fn test_merges_two_segments() {
        if !tool_available(Path::new("ffmpeg")) || !tool_available(Path::new("ffprobe")) {
            eprintln!("ffmpeg/ffprobe not found, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let a = record(dir.path().join("segment-0.mp4"), 1.0, 1.0, 80).await;
        let b = record(dir.path().join("segment-1.mp4"), 1.0, 1.0, 80).await;

        let exporter = Arc::new(FfmpegExporter::new("ffmpeg", "ffprobe"));
        let merger = SegmentMerger::new(exporter.clone(), dir.path());
        let merged = merger.merge(&[a.clone(), b.clone()]).await.unwrap();

        assert!(!a.exists() && !b.exists());
        let duration = exporter.probe_duration(&merged).unwrap().as_secs_f64();
        assert!((duration - 2.0).abs() < 0.2, "merged duration {}", duration);
    }

    #[tokio::test]
    async fn test_segment_content_starts_at_its_offset() {
        if !tool_available(Path::new("ffmpeg")) || !tool_available(Path::new("ffprobe")) {
            eprintln!("ffmpeg/ffprobe not found, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        // Audio outlives the video by half a second
        let dark = record(dir.path().join("segment-0.mp4"), 1.0, 1.5, 40).await;
        let light = record(dir.path().join("segment-1.mp4"), 1.0, 1.0, 200).await;

        let exporter = Arc::new(FfmpegExporter::new("ffmpeg", "ffprobe"));
        let first = exporter.probe_duration(&dark).unwrap().as_secs_f64();
        let merger = SegmentMerger::new(exporter.clone(), dir.path());
        let merged = merger.merge(&[dark, light]).await.unwrap();

        let total = exporter.probe_duration(&merged).unwrap().as_secs_f64();
        assert!((first - 1.5).abs() < 0.1, "first segment {}", first);
        assert!((total - 2.5).abs() < 0.2, "merged duration {}", total);

        assert!((luma_at(&merged, 0.5) - 40.0).abs() < 12.0);
        assert!((luma_at(&merged, first + 0.5) - 200.0).abs() < 12.0);
    }
}
