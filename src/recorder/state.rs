//! Recording state management
//!
//! Defines the recording state machine, segment tracking and the recorder
//! configuration.

use crate::encoder::EncoderSettings;
use crate::merger::ExportQuality;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::RecorderError;

/// Current state of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Last recording finished
    Stopped,
}

impl RecordingState {
    /// A recording has been started and not yet stopped
    pub fn is_active(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

/// One recording segment
///
/// With segment-split pausing every segment is its own file. With in-place
/// pausing all segments share the same file and only the time markers differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,

    /// File this segment is written to
    pub path: PathBuf,

    /// Duration of this segment in milliseconds
    pub duration_ms: f64,

    /// Process time when the segment started (relative to recording start)
    pub process_time_start_ms: f64,

    /// Process time when the segment ended
    pub process_time_end_ms: f64,

    /// Unix timestamp when the segment started
    pub unix_start_ms: u64,

    /// Unix timestamp when the segment ended
    pub unix_end_ms: u64,
}

impl Segment {
    /// Create a segment starting now
    pub fn new(index: usize, path: PathBuf, process_time_ms: f64) -> Self {
        let now = Utc::now().timestamp_millis() as u64;
        Self {
            index,
            path,
            duration_ms: 0.0,
            process_time_start_ms: process_time_ms,
            process_time_end_ms: process_time_ms,
            unix_start_ms: now,
            unix_end_ms: now,
        }
    }

    /// End the segment
    pub fn end(&mut self, process_time_ms: f64) {
        self.process_time_end_ms = process_time_ms;
        self.duration_ms = self.process_time_end_ms - self.process_time_start_ms;
        self.unix_end_ms = Utc::now().timestamp_millis() as u64;
    }
}

/// What `pause()` does with the active encoder session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PauseStrategy {
    /// Finalize the session; resume starts a new segment file
    #[default]
    SegmentSplit,
    /// Keep the file open and cut the paused interval from its timeline
    InPlace,
}

/// Which encoder/exporter pair the recorder uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaBackend {
    /// H.264/AAC through external ffmpeg processes
    #[default]
    Ffmpeg,
    /// JSON manifests only, no encoding
    Manifest,
}

/// Locations of the external media tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for MediaTools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Directory for segments, merged recordings and snapshots
    pub output_dir: PathBuf,

    pub pause_strategy: PauseStrategy,

    /// How long `start()` waits for the capture source
    pub ready_timeout_ms: u64,

    /// Bound of the capture channel
    pub capture_queue_capacity: usize,

    pub encoder: EncoderSettings,

    /// Quality of the re-encode when segments are merged
    pub merge_quality: ExportQuality,

    pub backend: MediaBackend,

    pub tools: MediaTools,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("watermark-recorder"),
            pause_strategy: PauseStrategy::default(),
            ready_timeout_ms: 3000,
            capture_queue_capacity: crate::capture::session::DEFAULT_QUEUE_CAPACITY,
            encoder: EncoderSettings::default(),
            merge_quality: ExportQuality::default(),
            backend: MediaBackend::default(),
            tools: MediaTools::default(),
        }
    }
}

impl RecorderConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, RecorderError> {
        let content = std::fs::read_to_string(path)?;
        let config: RecorderConfig = serde_json::from_str(&content)
            .map_err(|e| RecorderError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        self.encoder
            .validate()
            .map_err(|e| RecorderError::Config(e.to_string()))?;
        if self.ready_timeout_ms == 0 {
            return Err(RecorderError::Config(
                "readyTimeoutMs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}
