//! Pipeline worker
//!
//! One thread drains the capture channel. For every video frame it applies
//! the capture-path transform, caches the frame for snapshots, hands it to
//! preview subscribers and, while a session is active, composites the
//! watermark and appends the result. Audio goes straight to the session.

use crate::capture::{CaptureEvent, FrameTransform, VideoFrame};
use crate::compositor::{WatermarkCompositor, WatermarkSpec};
use crate::encoder::EncoderSession;
use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::broadcast;

/// Preview frames buffered per subscriber before it starts lagging
const PREVIEW_CAPACITY: usize = 4;

/// State shared between the controller and the worker
pub struct PipelineShared {
    /// Active encoder session; swapped by the controller
    pub session: Mutex<Option<EncoderSession>>,
    pub watermark: RwLock<Option<Arc<WatermarkSpec>>>,
    pub compositor: Arc<dyn WatermarkCompositor>,
    /// Transform the worker applies when the source does not rotate
    pub transform: RwLock<FrameTransform>,
    /// Last frame seen, for snapshots
    pub latest: Mutex<Option<VideoFrame>>,
    pub preview: broadcast::Sender<VideoFrame>,
}

impl PipelineShared {
    pub fn new(compositor: Arc<dyn WatermarkCompositor>) -> Self {
        let (preview, _) = broadcast::channel(PREVIEW_CAPACITY);
        Self {
            session: Mutex::new(None),
            watermark: RwLock::new(None),
            compositor,
            transform: RwLock::new(FrameTransform::IDENTITY),
            latest: Mutex::new(None),
            preview,
        }
    }

    /// Make `session` the target of appends. A session it replaces is
    /// dropped unfinished.
    pub fn install_session(&self, session: EncoderSession) {
        if let Some(old) = self.session.lock().replace(session) {
            tracing::warn!("Replaced unfinished encoder session {:?}", old.output());
        }
    }

    /// Detach the active session so it can be finished outside the lock
    pub fn take_session(&self) -> Option<EncoderSession> {
        self.session.lock().take()
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut EncoderSession) -> R) -> Option<R> {
        self.session.lock().as_mut().map(f)
    }

    pub fn current_watermark(&self) -> Option<Arc<WatermarkSpec>> {
        self.watermark.read().clone()
    }

    /// Composite the current watermark onto `frame`
    pub fn composite(&self, frame: &VideoFrame) -> VideoFrame {
        let watermark = self.current_watermark();
        self.compositor.composite(frame, watermark.as_deref())
    }

    fn handle_video(&self, frame: VideoFrame) {
        let transform = *self.transform.read();
        let frame = transform.apply(&frame);

        *self.latest.lock() = Some(frame.clone());
        // No subscribers is fine
        let _ = self.preview.send(frame.clone());

        if self.session.lock().is_none() {
            return;
        }
        let composited = self.composite(&frame);
        self.with_session(|session| session.append_video(&composited));
    }
}

/// Run the worker until every producer of `rx` is gone
pub fn spawn(rx: Receiver<CaptureEvent>, shared: Arc<PipelineShared>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("recorder-pipeline".to_string())
        .spawn(move || {
            tracing::debug!("Pipeline worker started");
            let mut frames: u64 = 0;
            for event in rx {
                match event {
                    CaptureEvent::Video(frame) => {
                        frames += 1;
                        shared.handle_video(frame);
                    }
                    CaptureEvent::Audio(sample) => {
                        shared.with_session(|session| session.append_audio(&sample));
                    }
                    CaptureEvent::Barrier(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("Pipeline worker stopped after {} frames", frames);
        })
}
