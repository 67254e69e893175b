//! Recording commands
//!
//! The command surface exposed to the host application. Every command locks
//! the one controller, so control operations never interleave. Failures are
//! logged and surface as `false`/`None`.

use crate::compositor::{WatermarkMode, WatermarkSpec};
use crate::recorder::{RecordingEvent, RecordingState, SessionController};
use crate::utils::ErrorResponse;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Application state for recording
#[derive(Clone)]
pub struct RecorderState {
    pub controller: Arc<Mutex<SessionController>>,
}

impl RecorderState {
    pub fn new(controller: SessionController) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
        }
    }
}

/// Set the watermark from PNG bytes, or clear it with `None`
///
/// Bytes that fail to decode clear the current watermark, so frames pass
/// through unmarked, and the decode error is returned.
pub async fn set_watermark(
    state: &RecorderState,
    png: Option<Vec<u8>>,
    mode: WatermarkMode,
) -> Result<(), ErrorResponse> {
    let decoded = png
        .map(|bytes| WatermarkSpec::from_png_bytes(&bytes, mode))
        .transpose();
    let controller = state.controller.lock().await;
    match decoded {
        Ok(watermark) => {
            controller.set_watermark(watermark);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Failed to decode watermark, recording without it: {}", e);
            controller.set_watermark(None);
            Err(e.into())
        }
    }
}

/// Change the mode of the current watermark
pub async fn set_watermark_mode(state: &RecorderState, mode: WatermarkMode) {
    let controller = state.controller.lock().await;
    controller.set_watermark_mode(mode);
}

/// Forward a device rotation change, in degrees
pub async fn set_device_rotation(state: &RecorderState, degrees: i32) -> Result<(), ErrorResponse> {
    let mut controller = state.controller.lock().await;
    controller
        .set_device_rotation(degrees)
        .await
        .map_err(ErrorResponse::from)
}

/// Open capture for preview
pub async fn open_capture(state: &RecorderState) -> Result<(), ErrorResponse> {
    let mut controller = state.controller.lock().await;
    controller.open_capture().await.map_err(ErrorResponse::from)
}

/// Start recording
pub async fn start_recording(state: &RecorderState) -> bool {
    let mut controller = state.controller.lock().await;
    match controller.start().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Failed to start recording: {}", e);
            false
        }
    }
}

/// Pause recording
pub async fn pause_recording(state: &RecorderState) -> bool {
    let mut controller = state.controller.lock().await;
    match controller.pause().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Pause ignored: {}", e);
            false
        }
    }
}

/// Resume recording
pub async fn resume_recording(state: &RecorderState) -> bool {
    let mut controller = state.controller.lock().await;
    match controller.resume() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Resume ignored: {}", e);
            false
        }
    }
}

/// Stop recording and return the final file
pub async fn stop_recording(state: &RecorderState) -> Option<PathBuf> {
    let mut controller = state.controller.lock().await;
    match controller.stop().await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!("Failed to stop recording: {}", e);
            None
        }
    }
}

pub async fn is_recording(state: &RecorderState) -> bool {
    state.controller.lock().await.is_recording()
}

/// Get current recording state
pub async fn get_recording_state(state: &RecorderState) -> RecordingState {
    state.controller.lock().await.state()
}

/// Get current recording duration in milliseconds
pub async fn get_recording_duration(state: &RecorderState) -> f64 {
    state.controller.lock().await.duration_ms()
}

/// Write the latest frame with the watermark as a PNG
pub async fn capture_snapshot(state: &RecorderState) -> Option<PathBuf> {
    let controller = state.controller.lock().await;
    match controller.capture_snapshot().await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!("Failed to capture snapshot: {}", e);
            None
        }
    }
}

pub async fn subscribe_events(state: &RecorderState) -> broadcast::Receiver<RecordingEvent> {
    state.controller.lock().await.subscribe()
}

/// Stop everything and release capture
pub async fn dispose(state: &RecorderState) {
    state.controller.lock().await.dispose().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraFacing, ManualSource};
    use crate::compositor::RgbaImage;
    use crate::encoder::ManifestMuxer;
    use crate::merger::ManifestExporter;
    use crate::recorder::{MediaBackend, RecorderConfig};

    fn state(dir: &std::path::Path) -> (RecorderState, crate::capture::ManualFeed) {
        let (source, feed) = ManualSource::new(CameraFacing::Back);
        let config = RecorderConfig {
            output_dir: dir.to_path_buf(),
            backend: MediaBackend::Manifest,
            ready_timeout_ms: 1000,
            ..Default::default()
        };
        let controller = SessionController::new(
            config,
            Box::new(source),
            Arc::new(ManifestMuxer::new()),
            Arc::new(ManifestExporter),
        );
        (RecorderState::new(controller), feed)
    }

    #[tokio::test]
    async fn test_commands_report_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let (state, feed) = state(dir.path());

        assert!(!pause_recording(&state).await);
        assert!(!resume_recording(&state).await);
        assert_eq!(stop_recording(&state).await, None);
        assert_eq!(get_recording_state(&state).await, RecordingState::Idle);
        assert_eq!(capture_snapshot(&state).await, None);

        open_capture(&state).await.unwrap();
        feed.set_ready(true);
        assert!(start_recording(&state).await);
        assert!(!start_recording(&state).await);
        assert!(pause_recording(&state).await);
        assert!(is_recording(&state).await);
        assert!(resume_recording(&state).await);
        assert_eq!(get_recording_state(&state).await, RecordingState::Recording);

        // No frames were captured
        assert_eq!(stop_recording(&state).await, None);
        assert_eq!(get_recording_state(&state).await, RecordingState::Stopped);
        dispose(&state).await;
    }

    #[tokio::test]
    async fn test_set_watermark_rejects_invalid_png() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _feed) = state(dir.path());
        state.controller.lock().await.set_watermark(Some(WatermarkSpec::new(
            RgbaImage::filled(4, 4, [0, 0, 255, 255]),
            WatermarkMode::Corner,
        )));

        let err = set_watermark(&state, Some(b"not a png".to_vec()), WatermarkMode::Corner)
            .await
            .unwrap_err();
        assert_eq!(err.code, "WATERMARK_ERROR");
        assert!(state.controller.lock().await.watermark().is_none());

        set_watermark(&state, None, WatermarkMode::Corner).await.unwrap();
        assert!(state.controller.lock().await.watermark().is_none());
    }
}
