//! Encoder session state machine
//!
//! `Created -> Configuring -> Writing -> Finishing -> Completed | Failed`
//!
//! Appends never block. Each track has a bounded queue drained by its own
//! writer thread; a full queue means the track is not ready and the sample
//! is dropped and counted.

use super::{
    AudioTrackConfig, EncoderCounters, EncoderError, EncoderResult, EncoderSettings,
    MuxerBackend, MuxerFinalizer, TrackTotals, VideoTrackConfig,
};
use crate::capture::traits::resample_linear;
use crate::capture::{AudioSample, VideoFrame};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Audio that starts later than this after the written audio is preceded by
/// silence
const AUDIO_GAP_TOLERANCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Created,
    Configuring,
    Writing,
    Finishing,
    Completed,
    Failed,
}

type WriterHandle = JoinHandle<io::Result<u64>>;

struct Tracks {
    video_tx: SyncSender<Arc<Vec<u8>>>,
    audio_tx: SyncSender<Vec<i16>>,
    video_writer: WriterHandle,
    audio_writer: WriterHandle,
    finalizer: Box<dyn MuxerFinalizer>,
    video: VideoTrackConfig,
    audio: AudioTrackConfig,
}

fn join_writer(handle: WriterHandle, track: &str) -> EncoderResult<u64> {
    match handle.join() {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(EncoderError::Backend(format!("{} writer failed: {}", track, e))),
        Err(_) => Err(EncoderError::Backend(format!("{} writer panicked", track))),
    }
}

impl Tracks {
    /// Close both queues, wait for the writers and complete the container
    fn finish(self, output: &Path) -> EncoderResult<TrackTotals> {
        drop(self.video_tx);
        drop(self.audio_tx);

        let video = join_writer(self.video_writer, "video");
        let audio = join_writer(self.audio_writer, "audio");
        let totals = match (video, audio) {
            (Ok(video_frames), Ok(audio_frames)) => TrackTotals {
                video_frames,
                audio_frames,
            },
            (Err(e), _) | (_, Err(e)) => {
                self.finalizer.abort();
                return Err(e);
            }
        };

        self.finalizer.finalize(totals)?;

        match std::fs::metadata(output) {
            Ok(meta) if meta.len() > 0 => Ok(totals),
            _ => Err(EncoderError::OutputMissing(output.to_path_buf())),
        }
    }

    /// Drop everything without producing output. Writers are not joined.
    fn abort(self) {
        drop(self.video_tx);
        drop(self.audio_tx);
        self.finalizer.abort();
    }
}

fn spawn_writer<T, F>(
    name: String,
    rx: Receiver<T>,
    mut sink: Box<dyn Write + Send>,
    mut write: F,
) -> io::Result<WriterHandle>
where
    T: Send + 'static,
    F: FnMut(&mut dyn Write, T) -> io::Result<u64> + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(move || {
        let mut total = 0;
        for item in rx {
            total += write(sink.as_mut(), item)?;
        }
        sink.flush()?;
        Ok(total)
    })
}

/// Timestamp bookkeeping for one session
#[derive(Debug, Default)]
struct Timeline {
    /// Capture PTS of the first appended frame
    origin: Option<Duration>,
    /// Capture time excluded from the output by in-place suspends
    paused_total: Duration,
    suspended: bool,
    /// Output time at which the session was suspended
    suspend_mark: Option<Duration>,
    /// Output time the first sample after a resume lands on
    resume_mark: Option<Duration>,
    /// Video frames written, duplicates included
    video_slots: u64,
    last_frame: Option<Arc<Vec<u8>>>,
    /// Audio sample frames written, silence included
    audio_frames: u64,
}

impl Timeline {
    /// Map a capture PTS onto the output timeline. `None` before the origin.
    fn output_time(&mut self, pts: Duration) -> Option<Duration> {
        let origin = self.origin?;
        let elapsed = pts.checked_sub(origin)?;
        if let Some(mark) = self.resume_mark.take() {
            self.paused_total = self.paused_total.max(elapsed.saturating_sub(mark));
        }
        elapsed.checked_sub(self.paused_total)
    }

    fn video_end(&self, fps: u32) -> Duration {
        Duration::from_secs_f64(self.video_slots as f64 / fps as f64)
    }

    fn audio_end(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.audio_frames as f64 / sample_rate as f64)
    }
}

/// One output file being recorded
pub struct EncoderSession {
    output: PathBuf,
    settings: EncoderSettings,
    backend: Arc<dyn MuxerBackend>,
    state: EncoderState,
    tracks: Option<Tracks>,
    timeline: Timeline,
    counters: Arc<EncoderCounters>,
}

impl EncoderSession {
    /// Bind a session to `output`. Nothing is opened until the first frame.
    pub fn new(output: PathBuf, settings: EncoderSettings, backend: Arc<dyn MuxerBackend>) -> Self {
        Self {
            output,
            settings,
            backend,
            state: EncoderState::Created,
            tracks: None,
            timeline: Timeline::default(),
            counters: Arc::new(EncoderCounters::default()),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn counters(&self) -> Arc<EncoderCounters> {
        self.counters.clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.timeline.suspended
    }

    /// Track dimensions once configured
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.tracks.as_ref().map(|t| (t.video.width, t.video.height))
    }

    /// Output duration written so far
    pub fn duration(&self) -> Duration {
        self.timeline.video_end(self.settings.fps.max(1))
    }

    fn configure(&mut self, frame: &VideoFrame) -> bool {
        if frame.width == 0 || frame.height == 0 || !frame.is_valid() {
            EncoderCounters::bump(&self.counters.frames_dropped_invalid);
            return false;
        }

        self.state = EncoderState::Configuring;
        match self.open_tracks(frame.width, frame.height) {
            Ok(tracks) => {
                tracing::info!(
                    "Encoder configured for {:?}: {}x{} @ {}fps, {} backend",
                    self.output,
                    frame.width,
                    frame.height,
                    self.settings.fps,
                    self.backend.name()
                );
                self.tracks = Some(tracks);
                self.state = EncoderState::Writing;
                true
            }
            Err(e) => {
                tracing::error!("Failed to configure encoder for {:?}: {}", self.output, e);
                self.state = EncoderState::Failed;
                false
            }
        }
    }

    fn open_tracks(&self, width: u32, height: u32) -> EncoderResult<Tracks> {
        self.settings.validate()?;

        let video = VideoTrackConfig {
            width,
            height,
            fps: self.settings.fps,
            bitrate: self.settings.video_bitrate,
            profile: self.settings.h264_profile.clone(),
            preset: self.settings.h264_preset.clone(),
        };
        let audio = AudioTrackConfig {
            sample_rate: self.settings.audio_sample_rate,
            channels: self.settings.audio_channels,
            bitrate: self.settings.audio_bitrate,
        };

        if let Some(parent) = self.output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handle = self.backend.open(&self.output, &video, &audio)?;

        let capacity = self.settings.track_queue_capacity;
        let (video_tx, video_rx) = mpsc::sync_channel::<Arc<Vec<u8>>>(capacity);
        let (audio_tx, audio_rx) = mpsc::sync_channel::<Vec<i16>>(capacity);

        let video_writer = spawn_writer(
            "encoder-video".to_string(),
            video_rx,
            handle.video,
            |sink, frame: Arc<Vec<u8>>| {
                sink.write_all(&frame)?;
                Ok(1)
            },
        );
        let video_writer = match video_writer {
            Ok(w) => w,
            Err(e) => {
                drop(handle.audio);
                handle.finalizer.abort();
                return Err(EncoderError::Configuration(format!(
                    "failed to spawn video writer: {}",
                    e
                )));
            }
        };

        let channels = audio.channels as usize;
        let audio_writer = spawn_writer(
            "encoder-audio".to_string(),
            audio_rx,
            handle.audio,
            move |sink, pcm: Vec<i16>| {
                let mut bytes = Vec::with_capacity(pcm.len() * 2);
                for s in &pcm {
                    bytes.extend_from_slice(&s.to_le_bytes());
                }
                sink.write_all(&bytes)?;
                Ok((pcm.len() / channels) as u64)
            },
        );
        let audio_writer = match audio_writer {
            Ok(w) => w,
            Err(e) => {
                drop(video_tx);
                handle.finalizer.abort();
                return Err(EncoderError::Configuration(format!(
                    "failed to spawn audio writer: {}",
                    e
                )));
            }
        };

        Ok(Tracks {
            video_tx,
            audio_tx,
            video_writer,
            audio_writer,
            finalizer: handle.finalizer,
            video,
            audio,
        })
    }

    /// Mark the session failed and release its resources
    fn fail(&mut self, reason: &str) {
        tracing::error!("Encoder session for {:?} failed: {}", self.output, reason);
        self.state = EncoderState::Failed;
        if let Some(tracks) = self.tracks.take() {
            tracks.abort();
        }
    }

    /// Queue one video slot. `Ok(false)` when the track is not ready.
    fn send_video(&mut self, data: Arc<Vec<u8>>) -> Result<bool, ()> {
        let Some(tracks) = &self.tracks else {
            return Err(());
        };
        match tracks.video_tx.try_send(data) {
            Ok(()) => {
                self.timeline.video_slots += 1;
                Ok(true)
            }
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(()),
        }
    }

    /// Append a composited frame. Returns false when the frame was dropped.
    pub fn append_video(&mut self, frame: &VideoFrame) -> bool {
        match self.state {
            EncoderState::Created => {
                if self.timeline.suspended || !self.configure(frame) {
                    return false;
                }
            }
            EncoderState::Configuring => {
                EncoderCounters::bump(&self.counters.frames_dropped_unconfigured);
                return false;
            }
            EncoderState::Writing => {}
            EncoderState::Finishing | EncoderState::Completed | EncoderState::Failed => {
                return false;
            }
        }
        if self.timeline.suspended {
            return false;
        }

        let (width, height, max_fill) = match &self.tracks {
            Some(t) => (
                t.video.width,
                t.video.height,
                t.video.fps as u64 * self.settings.max_gap_fill_secs as u64,
            ),
            None => return false,
        };
        if frame.width != width || frame.height != height || !frame.is_valid() {
            EncoderCounters::bump(&self.counters.frames_dropped_invalid);
            tracing::debug!(
                "Dropping {}x{} frame on {}x{} track",
                frame.width,
                frame.height,
                width,
                height
            );
            return false;
        }

        let fps = self.settings.fps;
        if self.timeline.origin.is_none() {
            self.timeline.origin = Some(frame.pts);
        }
        let Some(rel) = self.timeline.output_time(frame.pts) else {
            EncoderCounters::bump(&self.counters.frames_dropped_non_monotonic);
            return false;
        };

        let mut slot = (rel.as_secs_f64() * fps as f64).round() as u64;
        let next = self.timeline.video_slots;
        if slot < next {
            if slot + 1 == next {
                EncoderCounters::bump(&self.counters.frames_coalesced);
            } else {
                EncoderCounters::bump(&self.counters.frames_dropped_non_monotonic);
            }
            return false;
        }

        let gap = slot - next;
        if gap > max_fill {
            // Treat a long stall like a pause rather than freezing the picture
            let skipped = gap - max_fill;
            self.timeline.paused_total += Duration::from_secs_f64(skipped as f64 / fps as f64);
            slot -= skipped;
            tracing::warn!(
                "Video stalled for {} frames on {:?}; skipping {} slots",
                gap,
                self.output,
                skipped
            );
        }

        if let Some(previous) = self.timeline.last_frame.clone() {
            while self.timeline.video_slots < slot {
                match self.send_video(previous.clone()) {
                    Ok(true) => EncoderCounters::bump(&self.counters.frames_duplicated),
                    Ok(false) => break,
                    Err(()) => {
                        self.fail("video writer stopped");
                        return false;
                    }
                }
            }
        }

        let data = frame.shared_pixels();
        match self.send_video(data.clone()) {
            Ok(true) => {
                self.timeline.last_frame = Some(data);
                EncoderCounters::bump(&self.counters.frames_appended);
                true
            }
            Ok(false) => {
                EncoderCounters::bump(&self.counters.frames_dropped_not_ready);
                false
            }
            Err(()) => {
                self.fail("video writer stopped");
                false
            }
        }
    }

    /// Append a microphone chunk. Returns false when the chunk was dropped.
    pub fn append_audio(&mut self, sample: &AudioSample) -> bool {
        if self.state != EncoderState::Writing || self.timeline.suspended {
            if matches!(self.state, EncoderState::Created | EncoderState::Configuring) {
                EncoderCounters::bump(&self.counters.audio_chunks_dropped);
            }
            return false;
        }
        let Some(audio) = self.tracks.as_ref().map(|t| t.audio) else {
            return false;
        };
        if sample.samples.is_empty() || sample.channels == 0 || sample.sample_rate == 0 {
            return false;
        }

        let Some(rel) = self.timeline.output_time(sample.pts) else {
            EncoderCounters::bump(&self.counters.audio_chunks_dropped);
            return false;
        };

        let mut pcm = sample.remix(audio.channels);
        if sample.sample_rate != audio.sample_rate {
            pcm = resample_linear(&pcm, audio.channels, sample.sample_rate, audio.sample_rate);
        }
        let chunk_frames = (pcm.len() / audio.channels as usize) as u64;

        let written = self.timeline.audio_end(audio.sample_rate);
        let mut silence_frames = 0u64;
        if rel > written + AUDIO_GAP_TOLERANCE {
            silence_frames = ((rel - written).as_secs_f64() * audio.sample_rate as f64).round() as u64;
            let mut padded = vec![0i16; silence_frames as usize * audio.channels as usize];
            padded.extend_from_slice(&pcm);
            pcm = padded;
        }

        let Some(tracks) = &self.tracks else {
            return false;
        };
        match tracks.audio_tx.try_send(pcm) {
            Ok(()) => {
                self.timeline.audio_frames += silence_frames + chunk_frames;
                EncoderCounters::bump(&self.counters.audio_chunks_appended);
                EncoderCounters::add(&self.counters.silence_frames_inserted, silence_frames);
                true
            }
            Err(TrySendError::Full(_)) => {
                EncoderCounters::bump(&self.counters.audio_chunks_dropped);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.fail("audio writer stopped");
                false
            }
        }
    }

    /// Stop accepting samples without closing the file
    pub fn suspend(&mut self) -> bool {
        if self.timeline.suspended
            || !matches!(self.state, EncoderState::Created | EncoderState::Writing)
        {
            return false;
        }
        let video_end = self.timeline.video_end(self.settings.fps.max(1));
        let audio_end = self.timeline.audio_end(self.settings.audio_sample_rate.max(1));
        self.timeline.suspend_mark = Some(video_end.max(audio_end));
        self.timeline.suspended = true;
        tracing::info!("Encoder session suspended at {:?}", video_end);
        true
    }

    /// Continue after [`suspend`](Self::suspend); the paused interval is cut
    /// from the output
    pub fn resume(&mut self) -> bool {
        if !self.timeline.suspended {
            return false;
        }
        self.timeline.suspended = false;
        let mark = self.timeline.suspend_mark.take();
        if self.timeline.origin.is_some() {
            self.timeline.resume_mark = mark;
        }
        tracing::info!("Encoder session resumed");
        true
    }

    /// Close both tracks and finalize the container
    ///
    /// Runs the blocking part on the tokio blocking pool. On success the
    /// output exists and is non-empty.
    pub async fn finish(&mut self) -> EncoderResult<PathBuf> {
        match self.state {
            EncoderState::Writing => {}
            EncoderState::Created | EncoderState::Configuring => {
                self.state = EncoderState::Failed;
                return Err(EncoderError::Empty(self.output.clone()));
            }
            EncoderState::Failed => {
                if let Some(tracks) = self.tracks.take() {
                    tracks.abort();
                }
                return Err(EncoderError::Backend(format!(
                    "session for {:?} already failed",
                    self.output
                )));
            }
            EncoderState::Finishing | EncoderState::Completed => {
                return Err(EncoderError::InvalidState(format!(
                    "session already {:?}",
                    self.state
                )));
            }
        }

        let Some(tracks) = self.tracks.take() else {
            self.state = EncoderState::Failed;
            return Err(EncoderError::InvalidState("no tracks to finish".to_string()));
        };
        self.state = EncoderState::Finishing;
        self.timeline.last_frame = None;

        let output = self.output.clone();
        let result = tokio::task::spawn_blocking(move || tracks.finish(&output))
            .await
            .map_err(|e| EncoderError::Backend(format!("finalize task failed: {}", e)))
            .and_then(|r| r);

        let counters = self.counters.snapshot();
        match result {
            Ok(totals) => {
                self.state = EncoderState::Completed;
                tracing::info!(
                    "Encoder session completed {:?}: {} video frames, {} audio frames, {:?}",
                    self.output,
                    totals.video_frames,
                    totals.audio_frames,
                    counters
                );
                Ok(self.output.clone())
            }
            Err(e) => {
                self.state = EncoderState::Failed;
                tracing::error!(
                    "Encoder session failed to finalize {:?}: {} ({:?})",
                    self.output,
                    e,
                    counters
                );
                Err(e)
            }
        }
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        if let Some(tracks) = self.tracks.take() {
            tracing::warn!("Encoder session for {:?} dropped without finishing", self.output);
            tracks.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CameraFacing;
    use crate::encoder::manifest::{ManifestMuxer, RecordingManifest};

    fn frame(tick: u8, ms: u64) -> VideoFrame {
        VideoFrame::new(
            vec![tick; 4 * 4 * 4],
            4,
            4,
            Duration::from_millis(ms),
            CameraFacing::Back,
        )
    }

    fn audio(ms: u64, frames: usize) -> AudioSample {
        AudioSample::new(vec![100; frames * 2], Duration::from_millis(ms), 44_100, 2)
    }

    fn session(dir: &Path, muxer: &ManifestMuxer) -> EncoderSession {
        EncoderSession::new(
            dir.join("segment-0.mp4"),
            EncoderSettings::default(),
            Arc::new(muxer.clone()),
        )
    }

    #[tokio::test]
    async fn test_configures_on_first_valid_frame() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::retaining_frames();
        let mut session = session(dir.path(), &muxer);
        assert_eq!(session.state(), EncoderState::Created);

        let empty = VideoFrame::new(Vec::new(), 0, 0, Duration::ZERO, CameraFacing::Back);
        assert!(!session.append_video(&empty));
        assert_eq!(session.state(), EncoderState::Created);

        assert!(!session.append_audio(&audio(0, 441)));
        assert!(session.append_video(&frame(1, 0)));
        assert_eq!(session.state(), EncoderState::Writing);
        assert_eq!(session.dimensions(), Some((4, 4)));

        let path = session.finish().await.unwrap();
        assert_eq!(session.state(), EncoderState::Completed);
        let manifest = RecordingManifest::load(&path).unwrap();
        assert_eq!(manifest.video_frames, 1);

        let snap = session.counters().snapshot();
        assert_eq!(snap.frames_dropped_invalid, 1);
        assert_eq!(snap.audio_chunks_dropped, 1);
    }

    #[tokio::test]
    async fn test_cfr_fill_and_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::retaining_frames();
        let mut session = session(dir.path(), &muxer);

        assert!(session.append_video(&frame(1, 1000)));
        // Same slot as the previous frame
        assert!(!session.append_video(&frame(2, 1010)));
        // Three slots later: two repeats then the frame
        assert!(session.append_video(&frame(3, 1100)));
        // Before the origin
        assert!(!session.append_video(&frame(4, 500)));

        let path = session.finish().await.unwrap();
        let recorded = muxer.recorded(&path).unwrap();
        let firsts: Vec<u8> = recorded.video_frames.iter().map(|f| f[0]).collect();
        assert_eq!(firsts, vec![1, 1, 1, 3]);

        let snap = session.counters().snapshot();
        assert_eq!(snap.frames_appended, 2);
        assert_eq!(snap.frames_coalesced, 1);
        assert_eq!(snap.frames_duplicated, 2);
        assert_eq!(snap.frames_dropped_non_monotonic, 1);
    }

    #[tokio::test]
    async fn test_audio_gap_filled_with_silence() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::retaining_frames();
        let mut session = session(dir.path(), &muxer);

        assert!(session.append_video(&frame(1, 0)));
        assert!(session.append_audio(&audio(0, 441)));
        // 10ms written, next chunk at 200ms: 190ms of silence
        assert!(session.append_audio(&audio(200, 441)));

        let path = session.finish().await.unwrap();
        let manifest = RecordingManifest::load(&path).unwrap();
        let silence = (0.19f64 * 44_100.0).round() as u64;
        assert_eq!(manifest.audio_frames, 441 + silence + 441);
        assert_eq!(session.counters().snapshot().silence_frames_inserted, silence);

        let recorded = muxer.recorded(&path).unwrap();
        assert_eq!(recorded.audio[0], 100);
        assert_eq!(recorded.audio[441 * 2], 0);
    }

    #[tokio::test]
    async fn test_audio_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::retaining_frames();
        let mut session = session(dir.path(), &muxer);
        assert!(session.append_video(&frame(1, 0)));

        // 20ms of mono at 48kHz becomes 20ms of stereo at 44.1kHz
        let mono = AudioSample::new(vec![7; 960], Duration::ZERO, 48_000, 1);
        assert!(session.append_audio(&mono));

        let path = session.finish().await.unwrap();
        let manifest = RecordingManifest::load(&path).unwrap();
        assert_eq!(manifest.audio_frames, 882);
        assert_eq!(manifest.channels, 2);
    }

    #[tokio::test]
    async fn test_suspend_cuts_paused_interval() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::retaining_frames();
        let mut session = session(dir.path(), &muxer);

        for i in 0..30u64 {
            assert!(session.append_video(&frame(1, i * 1000 / 30)));
        }
        assert!(session.suspend());
        assert!(!session.suspend());
        assert!(!session.append_video(&frame(9, 1500)));

        assert!(session.resume());
        for i in 0..30u64 {
            assert!(session.append_video(&frame(2, 5000 + i * 1000 / 30)));
        }

        let path = session.finish().await.unwrap();
        let manifest = RecordingManifest::load(&path).unwrap();
        assert_eq!(manifest.video_frames, 60);
        assert_eq!(session.counters().snapshot().frames_duplicated, 0);
    }

    #[tokio::test]
    async fn test_long_stall_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::new();
        let settings = EncoderSettings {
            max_gap_fill_secs: 1,
            track_queue_capacity: 256,
            ..Default::default()
        };
        let mut session =
            EncoderSession::new(dir.path().join("stall.mp4"), settings, Arc::new(muxer.clone()));

        assert!(session.append_video(&frame(1, 0)));
        // 10s gap at 30fps, only 1s of it is filled
        assert!(session.append_video(&frame(2, 10_000)));
        let path = session.finish().await.unwrap();
        let manifest = RecordingManifest::load(&path).unwrap();
        assert_eq!(manifest.video_frames, 32);
    }

    #[tokio::test]
    async fn test_finish_without_frames_fails() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::new();
        let mut session = session(dir.path(), &muxer);
        assert!(matches!(session.finish().await, Err(EncoderError::Empty(_))));
        assert_eq!(session.state(), EncoderState::Failed);
        assert!(!session.append_video(&frame(1, 0)));
    }

    #[tokio::test]
    async fn test_finish_twice_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::new();
        let mut session = session(dir.path(), &muxer);
        assert!(session.append_video(&frame(1, 0)));
        session.finish().await.unwrap();
        assert!(matches!(
            session.finish().await,
            Err(EncoderError::InvalidState(_))
        ));
        assert!(!session.append_video(&frame(1, 33)));
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = ManifestMuxer::blocking();
        let settings = EncoderSettings {
            track_queue_capacity: 1,
            ..Default::default()
        };
        let mut session =
            EncoderSession::new(dir.path().join("slow.mp4"), settings, Arc::new(muxer.clone()));

        let mut dropped = 0;
        for i in 0..10u64 {
            if !session.append_video(&frame(1, i * 33)) {
                dropped += 1;
            }
        }
        assert!(dropped > 0);
        assert!(session.counters().snapshot().frames_dropped_not_ready > 0);
        muxer.release();
    }
}
