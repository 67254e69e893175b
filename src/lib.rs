//! Watermark Recorder - real-time watermarked recording of a live camera.
//!
//! Captured frames are composited with a watermark, encoded together with
//! microphone audio and written to one container file per segment. Segments
//! produced by pause/resume are merged into a single output on stop.

pub mod capture;
pub mod commands;
pub mod compositor;
pub mod encoder;
pub mod merger;
pub mod recorder;
pub mod utils;

pub use commands::RecorderState;
pub use recorder::{RecorderConfig, RecordingEvent, RecordingState, SessionController};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// `RUST_LOG` overrides the default filter. Calling this twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watermark_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
