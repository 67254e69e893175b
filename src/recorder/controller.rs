//! Session controller
//!
//! Owns the capture session, the pipeline worker and the active encoder
//! session, and drives them through start, pause, resume and stop. Every
//! command takes `&mut self`, so callers serialize control operations by
//! owning the controller behind one lock.

use super::pipeline::{self, PipelineShared};
use super::state::{MediaBackend, PauseStrategy, RecorderConfig, RecordingState, Segment};
use super::{RecorderError, RecorderResult};
use crate::capture::{
    resolve_orientation, CaptureSession, CaptureSource, FrameTransform, Rotation, VideoFrame,
};
use crate::compositor::{write_png, CpuCompositor, WatermarkCompositor, WatermarkMode, WatermarkSpec};
use crate::encoder::{EncoderError, EncoderSession, FfmpegMuxer, ManifestMuxer, MuxerBackend};
use crate::merger::{FfmpegExporter, ManifestExporter, SegmentExporter, SegmentMerger};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

/// How long closing capture waits for the pipeline worker to drain
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long pause and stop wait for queued capture events to be appended
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Events emitted during recording
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    Started,
    Paused,
    Resumed,
    /// A segment file was finalized
    SegmentFinished(PathBuf),
    /// Final output, if any
    Stopped(Option<PathBuf>),
    Error(String),
}

pub struct SessionController {
    config: RecorderConfig,
    state: Arc<RwLock<RecordingState>>,
    capture: CaptureSession,
    shared: Arc<PipelineShared>,
    worker: Option<JoinHandle<()>>,
    muxer: Arc<dyn MuxerBackend>,
    merger: SegmentMerger,
    /// Segments of the current recording
    segments: Vec<Segment>,
    /// Finalized segment files awaiting merge
    finished: Vec<PathBuf>,
    recording_dir: Option<PathBuf>,
    start_time: Instant,
    device_rotation: i32,
    /// Rotation the capture source was opened with
    capture_rotation: Option<Rotation>,
    /// Rotation held fixed from start until stop
    locked_rotation: Option<Rotation>,
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl SessionController {
    pub fn new(
        config: RecorderConfig,
        source: Box<dyn CaptureSource>,
        muxer: Arc<dyn MuxerBackend>,
        exporter: Arc<dyn SegmentExporter>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let capture = CaptureSession::with_capacity(source, config.capture_queue_capacity);
        let merger = SegmentMerger::new(exporter, config.output_dir.clone());

        Self {
            config,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            capture,
            shared: Arc::new(PipelineShared::new(Arc::new(CpuCompositor::default()))),
            worker: None,
            muxer,
            merger,
            segments: Vec::new(),
            finished: Vec::new(),
            recording_dir: None,
            start_time: Instant::now(),
            device_rotation: 0,
            capture_rotation: None,
            locked_rotation: None,
            event_tx,
        }
    }

    /// Controller with the encoder and exporter named by `config.backend`
    pub fn from_config(config: RecorderConfig, source: Box<dyn CaptureSource>) -> Self {
        let (muxer, exporter): (Arc<dyn MuxerBackend>, Arc<dyn SegmentExporter>) =
            match config.backend {
                MediaBackend::Ffmpeg => (
                    Arc::new(FfmpegMuxer::new(config.tools.ffmpeg.clone())),
                    Arc::new(
                        FfmpegExporter::new(config.tools.ffmpeg.clone(), config.tools.ffprobe.clone())
                            .with_quality(config.merge_quality)
                            .with_audio_bitrate(config.encoder.audio_bitrate),
                    ),
                ),
                MediaBackend::Manifest => (Arc::new(ManifestMuxer::new()), Arc::new(ManifestExporter)),
            };
        Self::new(config, source, muxer, exporter)
    }

    /// Replace the compositing strategy. Only before capture is opened.
    pub fn with_compositor(mut self, compositor: Arc<dyn WatermarkCompositor>) -> Self {
        if self.worker.is_none() {
            self.shared = Arc::new(PipelineShared::new(compositor));
        }
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> RecordingState {
        *self.state.read()
    }

    /// Recording or paused
    pub fn is_recording(&self) -> bool {
        self.state().is_active()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_capture_open(&self) -> bool {
        self.capture.is_open()
    }

    /// Rotation the capture path currently applies
    pub fn capture_rotation(&self) -> Option<Rotation> {
        self.capture_rotation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Frames as captured, before any watermark
    pub fn subscribe_preview(&self) -> broadcast::Receiver<VideoFrame> {
        self.shared.preview.subscribe()
    }

    /// Get the current process time in milliseconds since recording start
    pub fn process_time_ms(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64() * 1000.0
    }

    /// Get total recording duration in milliseconds (excluding pauses)
    pub fn duration_ms(&self) -> f64 {
        let state = self.state();
        let (current, completed) = match self.segments.split_last() {
            Some((last, rest)) if state == RecordingState::Recording => {
                (self.process_time_ms() - last.process_time_start_ms, rest)
            }
            _ => (0.0, self.segments.as_slice()),
        };
        completed.iter().map(|s| s.duration_ms).sum::<f64>() + current
    }

    fn emit(&self, event: RecordingEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn rotation_hint(&self) -> Rotation {
        resolve_orientation(self.device_rotation, self.capture.facing().is_front())
    }

    /// Set or clear the watermark used for recording and snapshots
    pub fn set_watermark(&self, watermark: Option<WatermarkSpec>) {
        match &watermark {
            Some(wm) => tracing::info!(
                "Watermark set: {}x{} {:?}",
                wm.image().width,
                wm.image().height,
                wm.mode()
            ),
            None => tracing::info!("Watermark cleared"),
        }
        *self.shared.watermark.write() = watermark.map(Arc::new);
    }

    /// Switch the mode of the current watermark
    pub fn set_watermark_mode(&self, mode: WatermarkMode) {
        let mut watermark = self.shared.watermark.write();
        let replacement = match watermark.as_ref() {
            Some(current) if current.mode() != mode => Arc::new(current.with_mode(mode)),
            _ => return,
        };
        *watermark = Some(replacement);
        tracing::info!("Watermark mode changed to {:?}", mode);
    }

    pub fn watermark(&self) -> Option<Arc<WatermarkSpec>> {
        self.shared.current_watermark()
    }

    /// Open capture for preview without recording
    pub async fn open_capture(&mut self) -> RecorderResult<()> {
        let rotation = self.locked_rotation.unwrap_or_else(|| self.rotation_hint());
        self.ensure_capture(rotation).await
    }

    /// Update the device rotation
    ///
    /// Takes effect immediately while not recording. During a recording the
    /// rotation stays locked and the new value applies after `stop()`.
    pub async fn set_device_rotation(&mut self, degrees: i32) -> RecorderResult<()> {
        self.device_rotation = degrees;
        if self.locked_rotation.is_some() {
            tracing::debug!("Device rotation {}° deferred until recording stops", degrees);
            return Ok(());
        }
        if !self.capture.is_open() {
            return Ok(());
        }
        let rotation = self.rotation_hint();
        self.ensure_capture(rotation).await
    }

    async fn ensure_capture(&mut self, rotation: Rotation) -> RecorderResult<()> {
        if !self.capture.is_open() {
            return self.open_capture_with(rotation).await;
        }
        if self.capture_rotation == Some(rotation) {
            return Ok(());
        }

        if self.capture.applies_rotation() {
            tracing::info!("Reopening capture for rotation {}°", rotation.degrees());
            self.close_capture().await;
            self.open_capture_with(rotation).await
        } else {
            *self.shared.transform.write() = FrameTransform::rotate(rotation);
            self.capture_rotation = Some(rotation);
            tracing::info!("Capture rotation set to {}° (CPU)", rotation.degrees());
            Ok(())
        }
    }

    async fn open_capture_with(&mut self, rotation: Rotation) -> RecorderResult<()> {
        let rx = self.capture.open(rotation).await?;

        *self.shared.transform.write() = if self.capture.applies_rotation() {
            FrameTransform::IDENTITY
        } else {
            FrameTransform::rotate(rotation)
        };

        match pipeline::spawn(rx, self.shared.clone()) {
            Ok(worker) => self.worker = Some(worker),
            Err(e) => {
                tracing::error!("Failed to start pipeline worker: {}", e);
                self.close_capture().await;
                return Err(e.into());
            }
        }
        self.capture_rotation = Some(rotation);
        Ok(())
    }

    /// Close the capture source and wait for the worker to drain
    async fn close_capture(&mut self) {
        if let Err(e) = self.capture.close().await {
            tracing::warn!("Error closing capture: {}", e);
        }
        self.capture_rotation = None;

        if let Some(worker) = self.worker.take() {
            let join = tokio::task::spawn_blocking(move || worker.join());
            match tokio::time::timeout(WORKER_JOIN_TIMEOUT, join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(_))) => tracing::error!("Pipeline worker panicked"),
                Ok(Err(e)) => tracing::error!("Failed to join pipeline worker: {}", e),
                Err(_) => tracing::warn!(
                    "Pipeline worker still running after {:?}, detaching",
                    WORKER_JOIN_TIMEOUT
                ),
            }
        }
    }

    /// Wait until the worker has handled every event capture already queued
    async fn drain_capture(&self) {
        let Some(sink) = self.capture.sink() else {
            return;
        };
        let drained = tokio::task::spawn_blocking(move || sink.sync(DRAIN_TIMEOUT)).await;
        match drained {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "Capture queue not drained within {:?}, finishing with what was appended",
                DRAIN_TIMEOUT
            ),
            Err(e) => tracing::error!("Failed to drain capture queue: {}", e),
        }
    }

    /// Start recording
    pub async fn start(&mut self) -> RecorderResult<()> {
        if self.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }

        let rotation = self.rotation_hint();
        self.ensure_capture(rotation).await?;

        if let Err(e) = self.capture.wait_ready(self.config.ready_timeout()).await {
            tracing::error!("Capture not ready, recording not started: {}", e);
            self.close_capture().await;
            return Err(e.into());
        }

        let dir = self
            .config
            .output_dir
            .join(format!("recording-{}", Uuid::new_v4()));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!("Failed to create recording directory {:?}: {}", dir, e);
            self.close_capture().await;
            return Err(e.into());
        }

        self.locked_rotation = Some(rotation);
        self.segments.clear();
        self.finished.clear();
        self.recording_dir = Some(dir);
        self.start_time = Instant::now();
        self.begin_segment();

        *self.state.write() = RecordingState::Recording;
        tracing::info!(
            "Recording started: rotation={}°, pause strategy={:?}",
            rotation.degrees(),
            self.config.pause_strategy
        );
        self.emit(RecordingEvent::Started);
        Ok(())
    }

    /// Install a fresh encoder session for the next segment
    fn begin_segment(&mut self) {
        let index = self.segments.len();
        let dir = self
            .recording_dir
            .clone()
            .unwrap_or_else(|| self.config.output_dir.clone());
        let path = dir.join(format!("segment-{}.{}", index, self.muxer.extension()));

        tracing::info!("Segment {} started: {:?}", index, path);
        self.shared.install_session(EncoderSession::new(
            path.clone(),
            self.config.encoder.clone(),
            self.muxer.clone(),
        ));
        let now = self.process_time_ms();
        self.segments.push(Segment::new(index, path, now));
    }

    async fn finish_segment(&mut self, mut session: EncoderSession) {
        match session.finish().await {
            Ok(path) => {
                tracing::debug!("Segment finished: {:?}", path);
                self.finished.push(path.clone());
                self.emit(RecordingEvent::SegmentFinished(path));
            }
            Err(EncoderError::Empty(path)) => {
                tracing::warn!("Segment {:?} received no frames, skipping", path);
            }
            Err(e) => {
                tracing::error!("Failed to finalize segment {:?}: {}", session.output(), e);
                self.emit(RecordingEvent::Error(e.to_string()));
            }
        }
    }

    /// Pause recording
    pub async fn pause(&mut self) -> RecorderResult<()> {
        if self.state() != RecordingState::Recording {
            return Err(RecorderError::NotRecording);
        }
        let now = self.process_time_ms();
        self.drain_capture().await;

        match self.config.pause_strategy {
            PauseStrategy::SegmentSplit => {
                let session = self.shared.take_session();
                if let Some(session) = session {
                    self.finish_segment(session).await;
                }
            }
            PauseStrategy::InPlace => {
                if self.shared.with_session(|s| s.suspend()) != Some(true) {
                    tracing::warn!("Encoder session could not be suspended");
                }
            }
        }

        if let Some(segment) = self.segments.last_mut() {
            segment.end(now);
        }
        *self.state.write() = RecordingState::Paused;
        tracing::info!("Recording paused at {:.0}ms", self.duration_ms());
        self.emit(RecordingEvent::Paused);
        Ok(())
    }

    /// Resume recording
    pub fn resume(&mut self) -> RecorderResult<()> {
        if self.state() != RecordingState::Paused {
            return Err(RecorderError::NotPaused);
        }

        match self.config.pause_strategy {
            PauseStrategy::SegmentSplit => self.begin_segment(),
            PauseStrategy::InPlace => {
                if self.shared.with_session(|s| s.resume()) != Some(true) {
                    tracing::warn!("Encoder session could not be resumed");
                }
                if let Some(path) = self.segments.last().map(|s| s.path.clone()) {
                    let (index, now) = (self.segments.len(), self.process_time_ms());
                    self.segments.push(Segment::new(index, path, now));
                }
            }
        }

        *self.state.write() = RecordingState::Recording;
        tracing::info!("Recording resumed");
        self.emit(RecordingEvent::Resumed);
        Ok(())
    }

    /// Stop recording and return the final output
    ///
    /// Returns `None` when nothing was recording, when no frames were
    /// written, or when the merge failed (segments are then kept on disk).
    /// Capture is released on every path.
    pub async fn stop(&mut self) -> RecorderResult<Option<PathBuf>> {
        if !self.is_recording() {
            return Ok(None);
        }
        let now = self.process_time_ms();
        let was_recording = self.state() == RecordingState::Recording;

        if was_recording {
            self.drain_capture().await;
        }
        let session = self.shared.take_session();
        if let Some(session) = session {
            self.finish_segment(session).await;
        }
        if was_recording {
            if let Some(segment) = self.segments.last_mut() {
                segment.end(now);
            }
        }

        let output = self.merger.merge(&self.finished).await;
        match &output {
            Some(path) => {
                tracing::info!(
                    "Recording stopped: {:?} ({} segments, {:.0}ms)",
                    path,
                    self.segments.len(),
                    self.duration_ms()
                );
                self.finished.clear();
                self.segments.clear();
            }
            None if !self.finished.is_empty() => tracing::error!(
                "Merge failed, keeping {} segments: {:?}",
                self.finished.len(),
                self.finished
            ),
            None => tracing::warn!("Recording stopped without output"),
        }

        self.close_capture().await;
        self.locked_rotation = None;
        if let Some(dir) = self.recording_dir.take() {
            remove_if_empty(&dir);
        }

        *self.state.write() = RecordingState::Stopped;
        self.emit(RecordingEvent::Stopped(output.clone()));
        Ok(output)
    }

    /// Stop any recording and release every resource
    pub async fn dispose(&mut self) {
        if let Err(e) = self.stop().await {
            tracing::error!("Error stopping recording during dispose: {}", e);
        }
        self.close_capture().await;

        if let Some(watermark) = self.shared.current_watermark() {
            watermark.invalidate();
        }
        *self.shared.latest.lock() = None;
        self.segments.clear();
        self.finished.clear();
        *self.state.write() = RecordingState::Idle;
        tracing::info!("Session controller disposed");
    }

    /// Write the latest frame, with the current watermark, as a PNG
    ///
    /// Works whether or not a recording is running. Returns `None` when no
    /// frame has been captured yet.
    pub async fn capture_snapshot(&self) -> RecorderResult<Option<PathBuf>> {
        let latest = self.shared.latest.lock().clone();
        let Some(frame) = latest else {
            return Ok(None);
        };

        let dir = self.config.output_dir.clone();
        let path = dir.join(format!(
            "snapshot-{}.png",
            chrono::Local::now().format("%Y%m%d-%H%M%S%.3f")
        ));
        let shared = self.shared.clone();
        let target = path.clone();

        tokio::task::spawn_blocking(move || -> RecorderResult<()> {
            let composited = shared.composite(&frame);
            std::fs::create_dir_all(&dir)?;
            write_png(&target, composited.width, composited.height, composited.pixels())?;
            Ok(())
        })
        .await
        .map_err(|e| RecorderError::Task(e.to_string()))??;

        tracing::info!("Snapshot written to {:?}", path);
        Ok(Some(path))
    }
}

fn remove_if_empty(dir: &Path) {
    let empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        if let Err(e) = std::fs::remove_dir(dir) {
            tracing::warn!("Failed to remove recording directory {:?}: {}", dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::test_pattern;
    use crate::capture::{AudioSample, CameraFacing, CaptureError, ManualFeed, ManualSource};
    use crate::compositor::{load_png, RgbaImage};
    use crate::encoder::{EncoderSettings, RecordingManifest};

    const W: u32 = 64;
    const H: u32 = 48;

    fn config(dir: &Path, strategy: PauseStrategy) -> RecorderConfig {
        RecorderConfig {
            output_dir: dir.to_path_buf(),
            pause_strategy: strategy,
            ready_timeout_ms: 1000,
            backend: MediaBackend::Manifest,
            encoder: EncoderSettings {
                track_queue_capacity: 512,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn controller(
        dir: &Path,
        strategy: PauseStrategy,
        source: ManualSource,
    ) -> (SessionController, ManifestMuxer) {
        let muxer = ManifestMuxer::retaining_frames();
        let controller = SessionController::new(
            config(dir, strategy),
            Box::new(source),
            Arc::new(muxer.clone()),
            Arc::new(ManifestExporter),
        );
        (controller, muxer)
    }

    async fn start(controller: &mut SessionController, feed: &ManualFeed) {
        controller.open_capture().await.unwrap();
        feed.set_ready(true);
        controller.start().await.unwrap();
    }

    /// Push `frames` frames at 30 fps from `from_secs`, each with 1/30 s of audio
    fn feed_frames(feed: &ManualFeed, from_secs: f64, frames: u64) -> Vec<Vec<u8>> {
        let mut pushed = Vec::new();
        for i in 0..frames {
            let pts = Duration::from_secs_f64(from_secs + i as f64 / 30.0);
            let pixels = test_pattern(W, H, i);
            pushed.push(pixels.clone());
            assert!(feed.video(VideoFrame::new(pixels, W, H, pts, CameraFacing::Back)));
            assert!(feed.audio(AudioSample::new(vec![100; 1470 * 2], pts, 44_100, 2)));
        }
        assert!(feed.sync());
        pushed
    }

    #[tokio::test]
    async fn test_records_three_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);

        start(&mut controller, &feed).await;
        assert_eq!(controller.state(), RecordingState::Recording);
        feed_frames(&feed, 0.0, 90);

        let output = controller.stop().await.unwrap().unwrap();
        assert!(output.exists());
        let manifest = RecordingManifest::load(&output).unwrap();
        assert_eq!((manifest.width, manifest.height), (W, H));
        assert_eq!(manifest.video_frames, 90);
        assert!(manifest.audio_frames > 0);
        assert!((manifest.duration().as_secs_f64() - 3.0).abs() < 0.05);

        assert_eq!(controller.state(), RecordingState::Stopped);
        assert!(!controller.is_capture_open());
        assert!(!feed.video(VideoFrame::new(vec![0; 16], 2, 2, Duration::ZERO, CameraFacing::Back)));
    }

    #[tokio::test]
    async fn test_pause_resume_merges_segments() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);
        let mut events = controller.subscribe();

        start(&mut controller, &feed).await;
        feed_frames(&feed, 0.0, 30);
        controller.pause().await.unwrap();
        assert_eq!(controller.state(), RecordingState::Paused);

        // Captured while paused, never recorded
        feed_frames(&feed, 1.0, 15);
        controller.resume().unwrap();
        feed_frames(&feed, 2.0, 30);

        let output = controller.stop().await.unwrap().unwrap();
        let manifest = RecordingManifest::load(&output).unwrap();
        assert_eq!(manifest.sources.len(), 2);
        assert!(manifest.sources.iter().all(|p| !p.exists()));
        assert_eq!(manifest.video_frames, 60);
        assert!((manifest.duration().as_secs_f64() - 2.0).abs() < 0.05);
        assert_eq!(output.parent(), Some(dir.path()));
        assert!(controller.segments().is_empty());

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.first(), Some(&RecordingEvent::Started));
        assert!(received.contains(&RecordingEvent::Paused));
        assert!(received.contains(&RecordingEvent::Resumed));
        assert_eq!(
            received
                .iter()
                .filter(|e| matches!(e, RecordingEvent::SegmentFinished(_)))
                .count(),
            2
        );
        assert_eq!(received.last(), Some(&RecordingEvent::Stopped(Some(output))));
    }

    #[tokio::test]
    async fn test_in_place_pause_keeps_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::InPlace, source);

        start(&mut controller, &feed).await;
        feed_frames(&feed, 0.0, 30);
        controller.pause().await.unwrap();
        feed_frames(&feed, 1.0, 15);
        controller.resume().unwrap();
        assert_eq!(controller.segments().len(), 2);
        assert_eq!(controller.segments()[0].path, controller.segments()[1].path);
        feed_frames(&feed, 2.0, 30);

        let output = controller.stop().await.unwrap().unwrap();
        let manifest = RecordingManifest::load(&output).unwrap();
        assert!(manifest.sources.is_empty());
        assert_eq!(manifest.video_frames, 60);
        assert!((manifest.duration().as_secs_f64() - 2.0).abs() < 0.05);
    }

    /// Holds each frame long enough for the capture queue to back up
    struct SlowCompositor;

    impl WatermarkCompositor for SlowCompositor {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn composite(&self, frame: &VideoFrame, _watermark: Option<&WatermarkSpec>) -> VideoFrame {
            std::thread::sleep(Duration::from_millis(50));
            frame.clone()
        }
    }

    fn push_frames(feed: &ManualFeed, from_secs: f64, frames: u64) {
        for i in 0..frames {
            let pts = Duration::from_secs_f64(from_secs + i as f64 / 30.0);
            assert!(feed.video(VideoFrame::new(test_pattern(W, H, i), W, H, pts, CameraFacing::Back)));
            assert!(feed.audio(AudioSample::new(vec![100; 1470 * 2], pts, 44_100, 2)));
        }
    }

    #[tokio::test]
    async fn test_pause_and_stop_keep_queued_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);
        let mut controller = controller.with_compositor(Arc::new(SlowCompositor));

        start(&mut controller, &feed).await;
        push_frames(&feed, 0.0, 6);
        controller.pause().await.unwrap();
        controller.resume().unwrap();
        push_frames(&feed, 1.0, 6);

        let output = controller.stop().await.unwrap().unwrap();
        let manifest = RecordingManifest::load(&output).unwrap();
        assert_eq!(manifest.sources.len(), 2);
        assert_eq!(manifest.video_frames, 12);
    }

    #[tokio::test]
    async fn test_without_watermark_frames_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);

        start(&mut controller, &feed).await;
        let pushed = feed_frames(&feed, 0.0, 10);
        let output = controller.stop().await.unwrap().unwrap();

        let recorded = muxer.recorded(&output).unwrap();
        assert_eq!(recorded.video_frames, pushed);
    }

    #[tokio::test]
    async fn test_watermark_reaches_encoder_not_preview() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);
        controller.set_watermark(Some(WatermarkSpec::new(
            RgbaImage::filled(8, 4, [255, 0, 0, 255]),
            WatermarkMode::Corner,
        )));

        start(&mut controller, &feed).await;
        let mut preview = controller.subscribe_preview();
        let pushed = feed_frames(&feed, 0.0, 1);
        let output = controller.stop().await.unwrap().unwrap();

        let previewed = preview.try_recv().unwrap();
        assert_eq!(previewed.pixels(), &pushed[0][..]);

        let recorded = muxer.recorded(&output).unwrap();
        let frame = &recorded.video_frames[0];
        assert_ne!(frame, &pushed[0]);
        // Corner watermark is 16x8 at x=24, bottom edge 24 px up
        let row = (H - 24 - 1) as usize;
        let offset = (row * W as usize + 24) * 4;
        assert_eq!(&frame[offset..offset + 4], &[255, 0, 0, 255]);
        assert_eq!(&frame[..4], &pushed[0][..4]);
    }

    #[tokio::test]
    async fn test_cpu_rotation_without_hardware_support() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) =
            controller(dir.path(), PauseStrategy::SegmentSplit, source.without_rotation());

        start(&mut controller, &feed).await;
        // Back camera at device rotation 0 needs a quarter turn
        assert_eq!(controller.capture_rotation(), Some(Rotation::Deg90));
        feed_frames(&feed, 0.0, 3);

        let output = controller.stop().await.unwrap().unwrap();
        let manifest = RecordingManifest::load(&output).unwrap();
        assert_eq!((manifest.width, manifest.height), (H, W));
    }

    #[tokio::test]
    async fn test_rotation_reopens_capture_and_locks_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Front);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);

        controller.open_capture().await.unwrap();
        assert_eq!(feed.rotation(), Rotation::Deg270);
        controller.set_device_rotation(90).await.unwrap();
        assert_eq!(feed.rotation(), Rotation::Deg180);

        feed.set_ready(true);
        controller.start().await.unwrap();
        controller.set_device_rotation(270).await.unwrap();
        assert_eq!(feed.rotation(), Rotation::Deg180);
        assert_eq!(controller.capture_rotation(), Some(Rotation::Deg180));

        controller.stop().await.unwrap();
        controller.open_capture().await.unwrap();
        assert_eq!(feed.rotation(), Rotation::Deg0);
        controller.dispose().await;
    }

    #[tokio::test]
    async fn test_state_machine_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);

        assert!(matches!(controller.pause().await, Err(RecorderError::NotRecording)));
        assert!(matches!(controller.resume(), Err(RecorderError::NotPaused)));
        assert_eq!(controller.stop().await.unwrap(), None);
        assert_eq!(controller.state(), RecordingState::Idle);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        start(&mut controller, &feed).await;
        assert!(matches!(controller.start().await, Err(RecorderError::AlreadyRecording)));
        assert!(matches!(controller.resume(), Err(RecorderError::NotPaused)));
        controller.pause().await.unwrap();
        assert!(matches!(controller.pause().await, Err(RecorderError::NotRecording)));
        assert!(controller.is_recording());

        // Nothing was captured, so there is no output
        assert_eq!(controller.stop().await.unwrap(), None);
        assert!(!controller.is_recording());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_start_times_out_when_capture_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);
        controller.config.ready_timeout_ms = 50;

        let result = controller.start().await;
        assert!(matches!(
            result,
            Err(RecorderError::Capture(CaptureError::NotReady(_)))
        ));
        assert_eq!(controller.state(), RecordingState::Idle);
        assert!(!controller.is_capture_open());
        assert!(!feed.sync());
    }

    #[tokio::test]
    async fn test_snapshot_uses_latest_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let (mut controller, _muxer) = controller(dir.path(), PauseStrategy::SegmentSplit, source);

        controller.open_capture().await.unwrap();
        assert_eq!(controller.capture_snapshot().await.unwrap(), None);

        feed_frames(&feed, 0.0, 2);
        let path = controller.capture_snapshot().await.unwrap().unwrap();
        let image = load_png(&path).unwrap();
        assert_eq!((image.width, image.height), (W, H));
        assert_eq!(image.data, test_pattern(W, H, 1));
        assert_eq!(controller.state(), RecordingState::Idle);

        controller.dispose().await;
    }
}
