//! Synthetic capture sources
//!
//! `SyntheticCamera` generates a moving test pattern and a sine tone in real
//! time, for dry runs and demos without a camera. `ManualSource` hands its sink
//! to the caller, who pushes frames explicitly.

use super::orientation::Rotation;
use super::traits::{
    AudioSample, CameraFacing, CaptureEvent, CaptureResult, CaptureSource, FrameSink, VideoFrame,
};
use async_trait::async_trait;
use parking_lot::Mutex as ParkingMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generate one RGBA test-pattern frame: vertical color bars shifted by `tick`
pub fn test_pattern(width: u32, height: u32, tick: u64) -> Vec<u8> {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];

    let mut data = Vec::with_capacity(width as usize * height as usize * 4);
    let bar_width = (width as usize / BARS.len()).max(1);
    for _y in 0..height {
        for x in 0..width as usize {
            let bar = ((x + tick as usize) / bar_width) % BARS.len();
            data.extend_from_slice(&BARS[bar]);
            data.push(255);
        }
    }
    data
}

/// Interleaved 16-bit sine tone for `frames` sample frames starting at `first_frame`
pub fn sine_tone(first_frame: u64, frames: usize, sample_rate: u32, channels: u16, hz: f64) -> Vec<i16> {
    let mut samples = Vec::with_capacity(frames * channels as usize);
    for i in 0..frames as u64 {
        let t = (first_frame + i) as f64 / sample_rate as f64;
        let value = ((t * hz * std::f64::consts::TAU).sin() * i16::MAX as f64 * 0.25) as i16;
        for _ in 0..channels {
            samples.push(value);
        }
    }
    samples
}

/// Real-time test-pattern camera with a matching microphone tone
pub struct SyntheticCamera {
    id: String,
    width: u32,
    height: u32,
    fps: u32,
    facing: CameraFacing,
    sample_rate: u32,
    channels: u16,
    startup_delay: Duration,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SyntheticCamera {
    /// Landscape sensor-style source; portrait output comes from the rotation hint
    pub fn new(width: u32, height: u32, fps: u32, facing: CameraFacing) -> Self {
        Self {
            id: "synthetic".to_string(),
            width,
            height,
            fps: fps.max(1),
            facing,
            sample_rate: 44_100,
            channels: 2,
            startup_delay: Duration::ZERO,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Delay before the first frame, mimicking camera warm-up
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

#[async_trait]
impl CaptureSource for SyntheticCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn facing(&self) -> CameraFacing {
        self.facing
    }

    async fn open(&mut self, sink: FrameSink, rotation: Rotation) -> CaptureResult<()> {
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let (width, height, fps) = (self.width, self.height, self.fps);
        let (sample_rate, channels) = (self.sample_rate, self.channels);
        let facing = self.facing;
        let startup_delay = self.startup_delay;

        let handle = std::thread::spawn(move || {
            std::thread::sleep(startup_delay);
            sink.set_ready(true);

            let frame_interval = Duration::from_secs_f64(1.0 / fps as f64);
            let audio_frames_per_tick = (sample_rate / fps) as usize;
            let start = Instant::now();
            let mut tick: u64 = 0;

            while running.load(Ordering::SeqCst) {
                let pts = frame_interval * tick as u32;

                let frame = VideoFrame::new(test_pattern(width, height, tick), width, height, pts, facing);
                sink.push(CaptureEvent::Video(frame));

                let samples = sine_tone(
                    tick * audio_frames_per_tick as u64,
                    audio_frames_per_tick,
                    sample_rate,
                    channels,
                    440.0,
                );
                sink.push(CaptureEvent::Audio(AudioSample::new(samples, pts, sample_rate, channels)));

                tick += 1;
                let next = start + frame_interval * tick as u32;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    std::thread::sleep(wait);
                }
            }

            sink.set_ready(false);
            tracing::debug!("Synthetic camera delivered {} frames", tick);
        });

        self.thread = Some(handle);
        tracing::info!(
            "Synthetic camera started: {}x{} @ {}fps (rotation hint {}° applied downstream)",
            self.width,
            self.height,
            self.fps,
            rotation.degrees()
        );
        Ok(())
    }

    async fn close(&mut self) -> CaptureResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Caller-driven source: frames are pushed through the paired [`ManualFeed`]
pub struct ManualSource {
    facing: CameraFacing,
    applies_rotation: bool,
    shared: Arc<ParkingMutex<Option<FrameSink>>>,
    rotation: Arc<ParkingMutex<Rotation>>,
}

/// Handle used to drive a [`ManualSource`]
#[derive(Clone)]
pub struct ManualFeed {
    shared: Arc<ParkingMutex<Option<FrameSink>>>,
    rotation: Arc<ParkingMutex<Rotation>>,
}

impl ManualSource {
    pub fn new(facing: CameraFacing) -> (Self, ManualFeed) {
        let shared = Arc::new(ParkingMutex::new(None));
        let rotation = Arc::new(ParkingMutex::new(Rotation::Deg0));
        (
            Self {
                facing,
                applies_rotation: true,
                shared: shared.clone(),
                rotation: rotation.clone(),
            },
            ManualFeed { shared, rotation },
        )
    }

    /// Leave rotation to the pipeline instead of the source
    pub fn without_rotation(mut self) -> Self {
        self.applies_rotation = false;
        self
    }
}

#[async_trait]
impl CaptureSource for ManualSource {
    fn id(&self) -> &str {
        "manual"
    }

    fn facing(&self) -> CameraFacing {
        self.facing
    }

    fn applies_rotation(&self) -> bool {
        self.applies_rotation
    }

    async fn open(&mut self, sink: FrameSink, rotation: Rotation) -> CaptureResult<()> {
        *self.rotation.lock() = rotation;
        *self.shared.lock() = Some(sink);
        Ok(())
    }

    async fn close(&mut self) -> CaptureResult<()> {
        if let Some(sink) = self.shared.lock().take() {
            sink.set_ready(false);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.lock().is_some()
    }
}

impl ManualFeed {
    fn sink(&self) -> Option<FrameSink> {
        self.shared.lock().clone()
    }

    pub fn set_ready(&self, ready: bool) {
        if let Some(sink) = self.sink() {
            sink.set_ready(ready);
        }
    }

    /// Rotation hint the source was opened with
    pub fn rotation(&self) -> Rotation {
        *self.rotation.lock()
    }

    /// Push a frame, waiting for queue space. Returns false when closed.
    pub fn video(&self, frame: VideoFrame) -> bool {
        self.sink()
            .map(|sink| sink.push_wait(CaptureEvent::Video(frame)))
            .unwrap_or(false)
    }

    /// Push an audio chunk, waiting for queue space. Returns false when closed.
    pub fn audio(&self, sample: AudioSample) -> bool {
        self.sink()
            .map(|sink| sink.push_wait(CaptureEvent::Audio(sample)))
            .unwrap_or(false)
    }

    /// Block until the pipeline has processed everything pushed so far
    pub fn sync(&self) -> bool {
        self.sink()
            .map(|sink| sink.sync(Duration::from_secs(5)))
            .unwrap_or(false)
    }
}
