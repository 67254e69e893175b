//! Capture trait definitions
//!
//! Platform-agnostic frame types and the trait every capture source implements.
//! Sources push frames into a [`FrameSink`], the producer half of a bounded
//! single-producer channel drained by the recorder's pipeline worker.

use super::orientation::Rotation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Bytes per pixel of every frame flowing through the pipeline (RGBA8)
pub const BYTES_PER_PIXEL: usize = 4;

/// Which way the capturing camera faces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    #[default]
    Back,
    Front,
}

impl CameraFacing {
    pub fn is_front(&self) -> bool {
        matches!(self, CameraFacing::Front)
    }
}

/// One raw RGBA video frame.
///
/// The pixel buffer is shared and immutable: cloning a frame is cheap and never
/// lets one consumer (e.g. preview) observe another consumer's modifications.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp on the capture clock
    pub pts: Duration,
    pub facing: CameraFacing,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, pts: Duration, facing: CameraFacing) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            pts,
            facing,
        }
    }

    /// RGBA pixel data, row-major, top row first
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the pixel buffer
    pub fn shared_pixels(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.data)
    }

    /// Build a frame with the same timing/facing but different pixels
    pub fn with_pixels(&self, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(data, width, height, self.pts, self.facing)
    }

    /// Expected buffer length for the frame dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Dimensions are non-zero and the buffer matches them
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }

    /// Whether two frames share the same pixel buffer allocation
    pub fn shares_buffer(&self, other: &VideoFrame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// One chunk of interleaved signed 16-bit PCM audio
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub samples: Vec<i16>,
    pub pts: Duration,
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSample {
    pub fn new(samples: Vec<i16>, pts: Duration, sample_rate: u32, channels: u16) -> Self {
        let frames = if channels == 0 {
            0
        } else {
            samples.len() / channels as usize
        };
        let duration = if sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(frames as f64 / sample_rate as f64)
        };
        Self {
            samples,
            pts,
            duration,
            sample_rate,
            channels,
        }
    }

    /// Number of sample frames (one sample per channel)
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Re-interleave to `channels` channels.
    ///
    /// Down-mixing averages the source channels, up-mixing repeats the mix.
    pub fn remix(&self, channels: u16) -> Vec<i16> {
        if channels == self.channels || self.channels == 0 || channels == 0 {
            return self.samples.clone();
        }

        let src = self.channels as usize;
        let dst = channels as usize;
        let mut out = Vec::with_capacity(self.frame_count() * dst);
        for frame in self.samples.chunks_exact(src) {
            if src == 1 {
                out.extend(std::iter::repeat(frame[0]).take(dst));
            } else if dst == 1 {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                out.push((sum / src as i32) as i16);
            } else {
                for c in 0..dst {
                    out.push(frame[c.min(src - 1)]);
                }
            }
        }
        out
    }
}

/// Linearly resample interleaved PCM from `from` Hz to `to` Hz
pub fn resample_linear(samples: &[i16], channels: u16, from: u32, to: u32) -> Vec<i16> {
    if from == to || from == 0 || to == 0 || channels == 0 {
        return samples.to_vec();
    }

    let ch = channels as usize;
    let in_frames = samples.len() / ch;
    if in_frames == 0 {
        return Vec::new();
    }

    let out_frames = (in_frames as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    let mut out = Vec::with_capacity(out_frames * ch);
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = (pos as usize).min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);
        let frac = pos - idx as f64;
        for c in 0..ch {
            let a = samples[idx * ch + c] as f64;
            let b = samples[next * ch + c] as f64;
            out.push((a + (b - a) * frac).round() as i16);
        }
    }
    out
}

/// Event delivered from a capture source to the pipeline worker
#[derive(Debug)]
pub enum CaptureEvent {
    Video(VideoFrame),
    Audio(AudioSample),
    /// Acknowledged once every earlier event has been processed
    Barrier(SyncSender<()>),
}

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture configuration error: {0}")]
    Configuration(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Capture session already open")]
    AlreadyOpen,

    #[error("Capture session not open")]
    NotOpen,

    #[error("Capture source not ready after {0:?}")]
    NotReady(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

/// Producer half of the capture channel.
///
/// Cheap to clone. `push` never blocks: when the pipeline is behind, the event
/// is discarded and counted, which is the capture layer's late-frame policy.
#[derive(Clone)]
pub struct FrameSink {
    tx: SyncSender<CaptureEvent>,
    ready: Arc<watch::Sender<bool>>,
    discarded: Arc<AtomicU64>,
}

impl FrameSink {
    /// Create a sink with a bounded queue, returning the consumer half and
    /// the readiness receiver
    pub fn channel(capacity: usize) -> (Self, Receiver<CaptureEvent>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let (ready_tx, ready_rx) = watch::channel(false);
        (
            Self {
                tx,
                ready: Arc::new(ready_tx),
                discarded: Arc::new(AtomicU64::new(0)),
            },
            rx,
            ready_rx,
        )
    }

    /// Signal whether the source is running and delivering
    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Deliver without blocking; returns false if the event was discarded
    pub fn push(&self, event: CaptureEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Deliver, waiting for queue space. For producers that are not real-time.
    pub fn push_wait(&self, event: CaptureEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn push_video(&self, frame: VideoFrame) -> bool {
        self.push(CaptureEvent::Video(frame))
    }

    pub fn push_audio(&self, sample: AudioSample) -> bool {
        self.push(CaptureEvent::Audio(sample))
    }

    /// Block until the pipeline has processed everything delivered so far
    pub fn sync(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.send(CaptureEvent::Barrier(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Events discarded because the pipeline was behind
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// A source of camera frames and microphone audio
#[async_trait]
pub trait CaptureSource: Send {
    /// Source identifier, used in logs
    fn id(&self) -> &str;

    /// Facing of the camera this source reads from
    fn facing(&self) -> CameraFacing;

    /// Whether the source applies the rotation hint itself. When false the
    /// pipeline rotates frames on the CPU.
    fn applies_rotation(&self) -> bool {
        false
    }

    /// Start delivering into `sink`. Readiness is signalled through the sink
    /// once frames flow, which may be after this returns.
    async fn open(&mut self, sink: FrameSink, rotation: Rotation) -> CaptureResult<()>;

    /// Stop delivering and release the device. Must drop every sink clone.
    async fn close(&mut self) -> CaptureResult<()>;

    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_validity() {
        let frame = VideoFrame::new(vec![0; 16], 2, 2, Duration::ZERO, CameraFacing::Back);
        assert!(frame.is_valid());

        let short = VideoFrame::new(vec![0; 15], 2, 2, Duration::ZERO, CameraFacing::Back);
        assert!(!short.is_valid());

        let empty = VideoFrame::new(Vec::new(), 0, 0, Duration::ZERO, CameraFacing::Back);
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_clone_shares_buffer() {
        let frame = VideoFrame::new(vec![1; 16], 2, 2, Duration::ZERO, CameraFacing::Front);
        let copy = frame.clone();
        assert!(frame.shares_buffer(&copy));
    }

    #[test]
    fn test_audio_duration() {
        let sample = AudioSample::new(vec![0; 44_100 * 2], Duration::ZERO, 44_100, 2);
        assert_eq!(sample.frame_count(), 44_100);
        assert_eq!(sample.duration, Duration::from_secs(1));
    }

    #[test]
    fn test_remix_mono_to_stereo() {
        let sample = AudioSample::new(vec![10, -20], Duration::ZERO, 44_100, 1);
        assert_eq!(sample.remix(2), vec![10, 10, -20, -20]);
    }

    #[test]
    fn test_remix_stereo_to_mono() {
        let sample = AudioSample::new(vec![10, 30, -20, -40], Duration::ZERO, 44_100, 2);
        assert_eq!(sample.remix(1), vec![20, -30]);
    }

    #[test]
    fn test_resample_halves_frame_count() {
        let samples: Vec<i16> = (0..8).map(|i| i * 100).collect();
        let out = resample_linear(&samples, 1, 48_000, 24_000);
        assert_eq!(out, vec![0, 200, 400, 600]);
    }

    #[test]
    fn test_resample_same_rate_is_copy() {
        let samples = vec![1, 2, 3, 4];
        assert_eq!(resample_linear(&samples, 2, 44_100, 44_100), samples);
    }

    #[test]
    fn test_sink_discards_when_full() {
        let (sink, rx, _ready) = FrameSink::channel(1);
        let frame = VideoFrame::new(vec![0; 4], 1, 1, Duration::ZERO, CameraFacing::Back);
        assert!(sink.push_video(frame.clone()));
        assert!(!sink.push_video(frame));
        assert_eq!(sink.discarded(), 1);
        drop(rx);
    }

    #[test]
    fn test_sink_readiness() {
        let (sink, _rx, ready) = FrameSink::channel(1);
        assert!(!*ready.borrow());
        sink.set_ready(true);
        assert!(*ready.borrow());
    }
}
