//! Command handlers
//!
//! The control surface the host application calls into. Each command maps
//! internal errors onto the `bool`/`Option` results callers expect.

pub mod recording;

pub use recording::RecorderState;
