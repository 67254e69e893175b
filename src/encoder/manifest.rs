//! Manifest muxer: records track totals as JSON instead of encoding
//!
//! Used for dry runs and tests. The output file is a [`RecordingManifest`];
//! frames can optionally be kept in memory for inspection.

use super::{
    AudioTrackConfig, EncoderError, EncoderResult, MuxerBackend, MuxerFinalizer, MuxerHandle,
    TrackTotals, VideoTrackConfig,
};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Contents of a manifest output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingManifest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub created_at: DateTime<Utc>,
    /// Inputs of a merged recording, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<PathBuf>,
    /// Start of each input on the merged timeline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_offsets_ms: Vec<u64>,
}

impl RecordingManifest {
    pub fn video_duration(&self) -> Duration {
        if self.fps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.video_frames as f64 / self.fps as f64)
    }

    pub fn audio_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.audio_frames as f64 / self.sample_rate as f64)
    }

    /// Container duration: the longer of the two tracks
    pub fn duration(&self) -> Duration {
        self.video_duration().max(self.audio_duration())
    }

    pub fn load(path: &Path) -> EncoderResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            EncoderError::Backend(format!("invalid manifest {}: {}", path.display(), e))
        })
    }

    pub fn save(&self, path: &Path) -> EncoderResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EncoderError::Backend(format!("failed to serialize manifest: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Track data captured in memory for one output
#[derive(Debug, Clone, Default)]
pub struct RecordedTracks {
    pub video_bytes: u64,
    /// Complete frames, only when frames are retained
    pub video_frames: Vec<Vec<u8>>,
    pub audio_bytes: u64,
    /// Interleaved samples, only when frames are retained
    pub audio: Vec<i16>,
}

type SharedTracks = Arc<Mutex<RecordedTracks>>;
type RecordedMap = Arc<Mutex<HashMap<PathBuf, SharedTracks>>>;

/// Blocks writers until released; lets tests hold a track "not ready"
#[derive(Debug, Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

#[derive(Clone, Default)]
pub struct ManifestMuxer {
    retain_frames: bool,
    gate: Option<Arc<Gate>>,
    recorded: RecordedMap,
}

impl ManifestMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep every frame and audio sample in memory
    pub fn retaining_frames() -> Self {
        Self {
            retain_frames: true,
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn blocking() -> Self {
        Self {
            gate: Some(Arc::new(Gate::default())),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn release(&self) {
        if let Some(gate) = &self.gate {
            *gate.open.lock() = true;
            gate.cond.notify_all();
        }
    }

    /// Tracks recorded for `output`, while it is open or when frames are
    /// retained
    pub fn recorded(&self, output: &Path) -> Option<RecordedTracks> {
        let recorded = self.recorded.lock();
        recorded.get(output).map(|tracks| tracks.lock().clone())
    }
}

struct VideoCollector {
    frame_size: usize,
    retain: bool,
    pending: Vec<u8>,
    gate: Option<Arc<Gate>>,
    tracks: SharedTracks,
}

impl Write for VideoCollector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        let mut tracks = self.tracks.lock();
        tracks.video_bytes += buf.len() as u64;
        if self.retain && self.frame_size > 0 {
            self.pending.extend_from_slice(buf);
            while self.pending.len() >= self.frame_size {
                let rest = self.pending.split_off(self.frame_size);
                let frame = std::mem::replace(&mut self.pending, rest);
                tracks.video_frames.push(frame);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct AudioCollector {
    retain: bool,
    odd_byte: Option<u8>,
    tracks: SharedTracks,
}

impl Write for AudioCollector {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut tracks = self.tracks.lock();
        tracks.audio_bytes += buf.len() as u64;
        if self.retain {
            let mut bytes = buf;
            if let Some(lo) = self.odd_byte.take() {
                if let Some((&hi, rest)) = bytes.split_first() {
                    tracks.audio.push(i16::from_le_bytes([lo, hi]));
                    bytes = rest;
                } else {
                    self.odd_byte = Some(lo);
                }
            }
            let mut chunks = bytes.chunks_exact(2);
            for pair in &mut chunks {
                tracks.audio.push(i16::from_le_bytes([pair[0], pair[1]]));
            }
            if let [last] = chunks.remainder() {
                self.odd_byte = Some(*last);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ManifestFinalizer {
    output: PathBuf,
    video: VideoTrackConfig,
    audio: AudioTrackConfig,
    /// Entry to drop once the output is closed; `None` when retaining
    release: Option<RecordedMap>,
}

impl ManifestFinalizer {
    fn release(&self) {
        if let Some(recorded) = &self.release {
            recorded.lock().remove(&self.output);
        }
    }
}

impl MuxerFinalizer for ManifestFinalizer {
    fn finalize(self: Box<Self>, totals: TrackTotals) -> EncoderResult<()> {
        let manifest = RecordingManifest {
            width: self.video.width,
            height: self.video.height,
            fps: self.video.fps,
            video_frames: totals.video_frames,
            audio_frames: totals.audio_frames,
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            created_at: Utc::now(),
            sources: Vec::new(),
            source_offsets_ms: Vec::new(),
        };
        self.release();
        manifest.save(&self.output)?;
        tracing::debug!(
            "Wrote manifest {:?}: {} frames, {:?}",
            self.output,
            totals.video_frames,
            manifest.duration()
        );
        Ok(())
    }

    fn abort(self: Box<Self>) {
        self.release();
        tracing::debug!("Manifest output {:?} abandoned", self.output);
    }
}

impl MuxerBackend for ManifestMuxer {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn extension(&self) -> &'static str {
        "json"
    }

    fn open(
        &self,
        output: &Path,
        video: &VideoTrackConfig,
        audio: &AudioTrackConfig,
    ) -> EncoderResult<MuxerHandle> {
        let tracks: SharedTracks = Arc::new(Mutex::new(RecordedTracks::default()));
        self.recorded
            .lock()
            .insert(output.to_path_buf(), tracks.clone());

        Ok(MuxerHandle {
            video: Box::new(VideoCollector {
                frame_size: video.frame_size(),
                retain: self.retain_frames,
                pending: Vec::new(),
                gate: self.gate.clone(),
                tracks: tracks.clone(),
            }),
            audio: Box::new(AudioCollector {
                retain: self.retain_frames,
                odd_byte: None,
                tracks,
            }),
            finalizer: Box::new(ManifestFinalizer {
                output: output.to_path_buf(),
                video: video.clone(),
                audio: *audio,
                release: (!self.retain_frames).then(|| self.recorded.clone()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> (VideoTrackConfig, AudioTrackConfig) {
        (
            VideoTrackConfig {
                width: 2,
                height: 1,
                fps: 30,
                bitrate: 1,
                profile: "high".to_string(),
                preset: "veryfast".to_string(),
            },
            AudioTrackConfig {
                sample_rate: 44_100,
                channels: 2,
                bitrate: 128_000,
            },
        )
    }

    #[test]
    fn test_collects_split_writes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let muxer = ManifestMuxer::retaining_frames();
        let (video, audio) = configs();
        let mut handle = muxer.open(&output, &video, &audio).unwrap();

        handle.video.write_all(&[1, 1, 1, 1, 2, 2]).unwrap();
        handle.video.write_all(&[2, 2, 3, 3, 3, 3]).unwrap();
        handle.audio.write_all(&[0x01]).unwrap();
        handle.audio.write_all(&[0x02, 0xff, 0xff]).unwrap();

        let recorded = muxer.recorded(&output).unwrap();
        assert_eq!(recorded.video_frames.len(), 1);
        assert_eq!(recorded.video_frames[0], vec![1, 1, 1, 1, 2, 2, 2, 2]);
        assert_eq!(recorded.video_bytes, 12);
        assert_eq!(recorded.audio, vec![0x0201, -1]);
    }

    #[test]
    fn test_finalize_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let muxer = ManifestMuxer::new();
        let (video, audio) = configs();
        let handle = muxer.open(&output, &video, &audio).unwrap();

        handle
            .finalizer
            .finalize(TrackTotals {
                video_frames: 90,
                audio_frames: 132_300,
            })
            .unwrap();

        let manifest = RecordingManifest::load(&output).unwrap();
        assert_eq!(manifest.video_frames, 90);
        assert_eq!(manifest.video_duration(), Duration::from_secs(3));
        assert_eq!(manifest.duration(), Duration::from_secs(3));
        assert!(manifest.sources.is_empty());
        assert!(muxer.recorded(&output).is_none());
    }

    #[test]
    fn test_abort_releases_unretained_output() {
        let dir = tempfile::tempdir().unwrap();
        let (video, audio) = configs();

        let muxer = ManifestMuxer::new();
        let output = dir.path().join("dropped.mp4");
        let handle = muxer.open(&output, &video, &audio).unwrap();
        assert!(muxer.recorded(&output).is_some());
        handle.finalizer.abort();
        assert!(muxer.recorded(&output).is_none());

        let retaining = ManifestMuxer::retaining_frames();
        let kept = dir.path().join("kept.mp4");
        retaining.open(&kept, &video, &audio).unwrap().finalizer.abort();
        assert!(retaining.recorded(&kept).is_some());
    }
}
