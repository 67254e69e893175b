//! FFmpeg muxer backend
//!
//! Video is piped as raw RGBA into an ffmpeg process encoding H.264 into a
//! temporary video-only MP4. Audio is spooled as s16le PCM next to it. When
//! both tracks are closed the two are muxed into the final container with
//! AAC audio.

use super::{
    sibling_path, AudioTrackConfig, EncoderError, EncoderResult, MuxerBackend, MuxerFinalizer,
    MuxerHandle, TrackTotals, VideoTrackConfig,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Check that a media tool runs
pub fn tool_available(binary: &Path) -> bool {
    Command::new(binary)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    ffmpeg: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn video_args(video: &VideoTrackConfig, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-nostats".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgba".to_string(),
            "-s".to_string(),
            format!("{}x{}", video.width, video.height),
            "-r".to_string(),
            video.fps.to_string(),
            "-i".to_string(),
            "-".to_string(),
            // yuv420p needs even dimensions
            "-vf".to_string(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-profile:v".to_string(),
            video.profile.clone(),
            "-preset".to_string(),
            video.preset.clone(),
            "-b:v".to_string(),
            video.bitrate.to_string(),
            "-g".to_string(),
            (video.fps * 2).to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

impl MuxerBackend for FfmpegMuxer {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(
        &self,
        output: &Path,
        video: &VideoTrackConfig,
        audio: &AudioTrackConfig,
    ) -> EncoderResult<MuxerHandle> {
        let video_tmp = sibling_path(output, ".video.mp4");
        let audio_tmp = sibling_path(output, ".audio.pcm");

        let audio_file = File::create(&audio_tmp)?;

        let args = Self::video_args(video, &video_tmp);
        tracing::info!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                let _ = std::fs::remove_file(&audio_tmp);
                EncoderError::Configuration(format!("Failed to start FFmpeg encoder: {}", e))
            })?;

        let stdin = match process.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = process.kill();
                let _ = process.wait();
                let _ = std::fs::remove_file(&audio_tmp);
                return Err(EncoderError::Configuration(
                    "Failed to capture FFmpeg stdin".to_string(),
                ));
            }
        };

        Ok(MuxerHandle {
            video: Box::new(stdin),
            audio: Box::new(BufWriter::new(audio_file)),
            finalizer: Box::new(FfmpegFinalizer {
                process,
                job: MuxJob {
                    ffmpeg: self.ffmpeg.clone(),
                    output: output.to_path_buf(),
                    video_tmp,
                    audio_tmp,
                    audio: *audio,
                },
            }),
        })
    }
}

/// Final mux of the encoded video and spooled PCM
struct MuxJob {
    ffmpeg: PathBuf,
    output: PathBuf,
    video_tmp: PathBuf,
    audio_tmp: PathBuf,
    audio: AudioTrackConfig,
}

impl MuxJob {
    fn args(&self, has_audio: bool) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-nostats".to_string(),
            "-i".to_string(),
            self.video_tmp.to_string_lossy().to_string(),
        ];

        if has_audio {
            args.extend([
                "-f".to_string(),
                "s16le".to_string(),
                "-ar".to_string(),
                self.audio.sample_rate.to_string(),
                "-ac".to_string(),
                self.audio.channels.to_string(),
                "-i".to_string(),
                self.audio_tmp.to_string_lossy().to_string(),
            ]);
        } else {
            // Keep the container shape: always one video and one audio track
            let layout = if self.audio.channels == 1 { "mono" } else { "stereo" };
            args.extend([
                "-f".to_string(),
                "lavfi".to_string(),
                "-i".to_string(),
                format!("anullsrc=r={}:cl={}", self.audio.sample_rate, layout),
                "-shortest".to_string(),
            ]);
        }

        args.extend([
            "-map".to_string(),
            "0:v".to_string(),
            "-map".to_string(),
            "1:a".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.audio.bitrate.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            self.output.to_string_lossy().to_string(),
        ]);
        args
    }

    fn run(&self, has_audio: bool) -> EncoderResult<()> {
        let args = self.args(has_audio);
        tracing::info!("Muxing {:?}: {:?}", self.output, args);

        let muxed = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| EncoderError::Backend(format!("Failed to start FFmpeg mux: {}", e)))?;
        if !muxed.status.success() {
            let stderr = String::from_utf8_lossy(&muxed.stderr);
            return Err(EncoderError::Backend(format!("FFmpeg mux failed: {}", stderr)));
        }
        Ok(())
    }

    fn remove_temp_files(&self) {
        for path in [&self.video_tmp, &self.audio_tmp] {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("Failed to remove {:?}: {}", path, e);
            }
        }
    }
}

struct FfmpegFinalizer {
    process: Child,
    job: MuxJob,
}

impl MuxerFinalizer for FfmpegFinalizer {
    fn finalize(self: Box<Self>, totals: TrackTotals) -> EncoderResult<()> {
        let FfmpegFinalizer { process, job } = *self;

        // The video writer has closed stdin; wait for the encode to drain
        let encoded = process
            .wait_with_output()
            .map_err(|e| EncoderError::Backend(format!("Failed to wait for FFmpeg: {}", e)))?;
        if !encoded.status.success() {
            let stderr = String::from_utf8_lossy(&encoded.stderr);
            return Err(EncoderError::Backend(format!(
                "FFmpeg exited with error: {}",
                stderr
            )));
        }

        job.run(totals.audio_frames > 0)?;
        job.remove_temp_files();
        tracing::info!(
            "FFmpeg encoder finished: {} frames written to {:?}",
            totals.video_frames,
            job.output
        );
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        let _ = self.process.kill();
        let _ = self.process.wait();
        tracing::warn!(
            "FFmpeg encode for {:?} aborted; partial files kept",
            self.job.output
        );
    }
}
