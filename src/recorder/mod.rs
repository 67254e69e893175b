//! Recording system module
//!
//! This module implements the recording lifecycle:
//! - SessionController to orchestrate capture, encoding and merging
//! - Pipeline worker that composites and appends captured frames
//! - Recording state, segments and configuration

pub mod controller;
pub mod pipeline;
pub mod state;

pub use controller::{RecordingEvent, SessionController};
pub use state::{MediaBackend, MediaTools, PauseStrategy, RecorderConfig, RecordingState, Segment};

use crate::capture::CaptureError;
use crate::compositor::CompositeError;
use crate::encoder::EncoderError;
use crate::merger::MergeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Not paused")]
    NotPaused,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RecorderResult<T> = Result<T, RecorderError>;
