//! Capture session lifecycle
//!
//! Wraps a [`CaptureSource`] with an explicit open/close lifecycle and the
//! readiness signal the recorder waits on before starting.

use super::orientation::Rotation;
use super::traits::{CameraFacing, CaptureError, CaptureEvent, CaptureResult, CaptureSource, FrameSink};
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tokio::sync::watch;

/// Default bound of the capture channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Closed,
    Open,
}

/// Owned capture resource with a defined open/close lifecycle
pub struct CaptureSession {
    source: Box<dyn CaptureSource>,
    state: CaptureState,
    sink: Option<FrameSink>,
    ready_rx: Option<watch::Receiver<bool>>,
    queue_capacity: usize,
}

impl CaptureSession {
    pub fn new(source: Box<dyn CaptureSource>) -> Self {
        Self::with_capacity(source, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(source: Box<dyn CaptureSource>, queue_capacity: usize) -> Self {
        Self {
            source,
            state: CaptureState::Closed,
            sink: None,
            ready_rx: None,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CaptureState::Open
    }

    pub fn facing(&self) -> CameraFacing {
        self.source.facing()
    }

    pub fn source_id(&self) -> &str {
        self.source.id()
    }

    pub fn applies_rotation(&self) -> bool {
        self.source.applies_rotation()
    }

    /// Open the source and return the consumer half of its channel
    pub async fn open(&mut self, rotation: Rotation) -> CaptureResult<Receiver<CaptureEvent>> {
        if self.is_open() {
            return Err(CaptureError::AlreadyOpen);
        }

        let (sink, rx, ready_rx) = FrameSink::channel(self.queue_capacity);
        self.source.open(sink.clone(), rotation).await?;

        tracing::info!(
            "Capture session opened: source={}, facing={:?}, rotation={}°",
            self.source.id(),
            self.source.facing(),
            rotation.degrees()
        );

        self.sink = Some(sink);
        self.ready_rx = Some(ready_rx);
        self.state = CaptureState::Open;
        Ok(rx)
    }

    /// Whether the source has signalled that frames are flowing
    pub fn is_ready(&self) -> bool {
        self.is_open()
            && self
                .ready_rx
                .as_ref()
                .map(|rx| *rx.borrow())
                .unwrap_or(false)
    }

    /// Wait until the source is ready, up to `timeout`
    pub async fn wait_ready(&self, timeout: Duration) -> CaptureResult<()> {
        let mut rx = self.ready_rx.clone().ok_or(CaptureError::NotOpen)?;
        // Bound to a local so the `wait_for` future is dropped before `rx`
        #[allow(clippy::let_and_return)]
        let result = match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CaptureError::Capture(
                "capture source dropped its readiness signal".to_string(),
            )),
            Err(_) => Err(CaptureError::NotReady(timeout)),
        };
        result
    }

    /// Producer handle, for sources driven from outside the session
    pub fn sink(&self) -> Option<FrameSink> {
        self.sink.clone()
    }

    /// Events the source had to discard because the pipeline was behind
    pub fn discarded(&self) -> u64 {
        self.sink.as_ref().map(|s| s.discarded()).unwrap_or(0)
    }

    /// Close the source. Closing a closed session is a no-op.
    pub async fn close(&mut self) -> CaptureResult<()> {
        if !self.is_open() {
            return Ok(());
        }

        let discarded = self.discarded();
        self.sink = None;
        self.ready_rx = None;
        self.state = CaptureState::Closed;

        let result = self.source.close().await;
        tracing::info!(
            "Capture session closed: source={}, discarded events={}",
            self.source.id(),
            discarded
        );
        result
    }
}
