//! Encoder session and muxer backends
//!
//! An [`EncoderSession`] turns composited frames and microphone audio into one
//! container file. The actual encoding happens behind a [`MuxerBackend`]; the
//! session only deals with timing, readiness and lifecycle.

pub mod ffmpeg;
pub mod manifest;
pub mod session;

pub use ffmpeg::FfmpegMuxer;
pub use manifest::{ManifestMuxer, RecordingManifest};
pub use session::{EncoderSession, EncoderState};

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Encoder failure: {0}")]
    Backend(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No frames were recorded to {0}")]
    Empty(PathBuf),

    #[error("Output missing or empty: {0}")]
    OutputMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EncoderResult<T> = Result<T, EncoderError>;

/// Encoding parameters shared by every session of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncoderSettings {
    pub fps: u32,
    /// Video bit rate in bits per second
    pub video_bitrate: u32,
    pub h264_profile: String,
    pub h264_preset: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// Audio bit rate in bits per second
    pub audio_bitrate: u32,
    /// Pending samples per track before appends start dropping
    pub track_queue_capacity: usize,
    /// Longest video gap, in seconds, filled by repeating the previous frame
    pub max_gap_fill_secs: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            video_bitrate: 12_000_000,
            h264_profile: "high".to_string(),
            h264_preset: "veryfast".to_string(),
            audio_sample_rate: 44_100,
            audio_channels: 2,
            audio_bitrate: 128_000,
            track_queue_capacity: 30,
            max_gap_fill_secs: 2,
        }
    }
}

impl EncoderSettings {
    pub fn validate(&self) -> EncoderResult<()> {
        if self.fps == 0 {
            return Err(EncoderError::Configuration("fps must be > 0".to_string()));
        }
        if self.audio_sample_rate == 0 || self.audio_channels == 0 {
            return Err(EncoderError::Configuration(
                "audio sample rate and channels must be > 0".to_string(),
            ));
        }
        if self.track_queue_capacity == 0 {
            return Err(EncoderError::Configuration(
                "track queue capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Video track parameters, fixed from the first frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTrackConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    pub profile: String,
    pub preset: String,
}

impl VideoTrackConfig {
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Audio track parameters; samples arrive as interleaved s16le
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTrackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

/// What the writer threads delivered, handed to the finalizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackTotals {
    pub video_frames: u64,
    pub audio_frames: u64,
}

/// Opened tracks of one output file
///
/// `video` receives raw RGBA frames back to back, `audio` interleaved s16le
/// PCM. Both are dropped before the finalizer runs.
pub struct MuxerHandle {
    pub video: Box<dyn Write + Send>,
    pub audio: Box<dyn Write + Send>,
    pub finalizer: Box<dyn MuxerFinalizer>,
}

/// Completes or abandons an output file once both tracks are closed
pub trait MuxerFinalizer: Send {
    fn finalize(self: Box<Self>, totals: TrackTotals) -> EncoderResult<()>;

    /// Release resources without producing output
    fn abort(self: Box<Self>);
}

/// Creates the tracks for an output file
pub trait MuxerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension of the container files this backend writes
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(
        &self,
        output: &Path,
        video: &VideoTrackConfig,
        audio: &AudioTrackConfig,
    ) -> EncoderResult<MuxerHandle>;
}

/// Per-session diagnostic counters
#[derive(Debug, Default)]
pub struct EncoderCounters {
    pub frames_appended: AtomicU64,
    pub frames_dropped_not_ready: AtomicU64,
    pub frames_dropped_unconfigured: AtomicU64,
    pub frames_dropped_non_monotonic: AtomicU64,
    pub frames_dropped_invalid: AtomicU64,
    pub frames_coalesced: AtomicU64,
    pub frames_duplicated: AtomicU64,
    pub audio_chunks_appended: AtomicU64,
    pub audio_chunks_dropped: AtomicU64,
    pub silence_frames_inserted: AtomicU64,
}

/// Point-in-time copy of [`EncoderCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub frames_appended: u64,
    pub frames_dropped_not_ready: u64,
    pub frames_dropped_unconfigured: u64,
    pub frames_dropped_non_monotonic: u64,
    pub frames_dropped_invalid: u64,
    pub frames_coalesced: u64,
    pub frames_duplicated: u64,
    pub audio_chunks_appended: u64,
    pub audio_chunks_dropped: u64,
    pub silence_frames_inserted: u64,
}

impl EncoderCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            frames_appended: load(&self.frames_appended),
            frames_dropped_not_ready: load(&self.frames_dropped_not_ready),
            frames_dropped_unconfigured: load(&self.frames_dropped_unconfigured),
            frames_dropped_non_monotonic: load(&self.frames_dropped_non_monotonic),
            frames_dropped_invalid: load(&self.frames_dropped_invalid),
            frames_coalesced: load(&self.frames_coalesced),
            frames_duplicated: load(&self.frames_duplicated),
            audio_chunks_appended: load(&self.audio_chunks_appended),
            audio_chunks_dropped: load(&self.audio_chunks_dropped),
            silence_frames_inserted: load(&self.silence_frames_inserted),
        }
    }
}

/// Path next to `output` with `suffix` appended to the file stem
pub(crate) fn sibling_path(output: &Path, suffix: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{}{}", stem, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = EncoderSettings::default();
        assert_eq!(settings.fps, 30);
        assert_eq!(settings.video_bitrate, 12_000_000);
        assert_eq!(settings.h264_profile, "high");
        assert_eq!(settings.audio_sample_rate, 44_100);
        assert_eq!(settings.audio_channels, 2);
        assert_eq!(settings.audio_bitrate, 128_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_partial_json() {
        let settings: EncoderSettings = serde_json::from_str(r#"{"fps": 24}"#).unwrap();
        assert_eq!(settings.fps, 24);
        assert_eq!(settings.h264_preset, "veryfast");
    }

    #[test]
    fn test_settings_reject_zero_fps() {
        let settings = EncoderSettings {
            fps: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(EncoderError::Configuration(_))));
    }

    #[test]
    fn test_sibling_path() {
        let p = sibling_path(Path::new("/tmp/rec/segment-1.mp4"), ".audio.pcm");
        assert_eq!(p, PathBuf::from("/tmp/rec/segment-1.audio.pcm"));
    }

    #[test]
    fn test_counter_snapshot() {
        let counters = EncoderCounters::default();
        EncoderCounters::bump(&counters.frames_appended);
        EncoderCounters::add(&counters.frames_duplicated, 3);
        let snap = counters.snapshot();
        assert_eq!(snap.frames_appended, 1);
        assert_eq!(snap.frames_duplicated, 3);
        assert_eq!(snap.audio_chunks_dropped, 0);
    }
}
