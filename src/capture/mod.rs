//! Capture sources and the capture session
//!
//! Device enumeration and permissions live with the host application; this
//! module only defines what a source delivers and how its lifecycle is owned.

pub mod orientation;
pub mod session;
pub mod synthetic;
pub mod traits;

#[cfg(feature = "native-capture")]
pub mod native;

pub use orientation::{resolve as resolve_orientation, FrameTransform, Rotation};
pub use session::{CaptureSession, CaptureState};
pub use synthetic::{ManualFeed, ManualSource, SyntheticCamera};
pub use traits::{
    AudioSample, CameraFacing, CaptureError, CaptureEvent, CaptureResult, CaptureSource, FrameSink,
    VideoFrame,
};
