//! Watermark compositing
//!
//! A compositor takes a captured frame and an optional watermark and returns
//! the frame that goes to the encoder. The input frame is never modified, so
//! preview consumers keep seeing the unwatermarked picture.

pub mod image;
pub mod scale;
pub mod software;

pub use image::{decode_png, load_png, write_png, RgbaImage};
pub use scale::ScaleFilter;
pub use software::CpuCompositor;

use crate::capture::VideoFrame;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Watermark width as a fraction of the frame width in corner mode
pub const CORNER_WIDTH_RATIO: f64 = 0.25;

/// Distance in pixels from the right and bottom edges in corner mode
pub const CORNER_MARGIN: u32 = 24;

/// How the watermark is laid over the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkMode {
    /// Bottom-right corner at a quarter of the frame width
    #[default]
    Corner,
    /// Stretched over the whole frame
    Fullscreen,
}

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Watermark rectangle in frame pixels. `y` is measured from the bottom edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Placement {
    /// Compute where a `wm_width`x`wm_height` watermark lands on a frame
    pub fn compute(
        mode: WatermarkMode,
        frame_width: u32,
        frame_height: u32,
        wm_width: u32,
        wm_height: u32,
    ) -> Option<Placement> {
        if frame_width == 0 || frame_height == 0 || wm_width == 0 || wm_height == 0 {
            return None;
        }

        match mode {
            WatermarkMode::Fullscreen => Some(Placement {
                x: 0,
                y: 0,
                width: frame_width,
                height: frame_height,
            }),
            WatermarkMode::Corner => {
                let width = ((frame_width as f64 * CORNER_WIDTH_RATIO).round() as u32).max(1);
                let height =
                    ((width as f64 * wm_height as f64 / wm_width as f64).round() as u32).max(1);
                Some(Placement {
                    x: frame_width.saturating_sub(width + CORNER_MARGIN),
                    y: CORNER_MARGIN,
                    width,
                    height,
                })
            }
        }
    }

    /// Row of the top edge in top-down image coordinates; negative when the
    /// watermark is taller than the space above the margin
    pub fn top_row(&self, frame_height: u32) -> i64 {
        frame_height as i64 - self.y as i64 - self.height as i64
    }
}

/// Watermark scaled and premultiplied for one frame size
#[derive(Debug)]
pub struct ScaledWatermark {
    pub placement: Placement,
    /// Premultiplied RGBA, `placement.width * placement.height * 4` bytes
    pub pixels: Vec<u8>,
}

type CacheKey = (u32, u32, ScaleFilter);

/// A decoded watermark image with its mode and a per-frame-size cache of
/// the scaled overlay
#[derive(Debug)]
pub struct WatermarkSpec {
    image: Arc<RgbaImage>,
    mode: WatermarkMode,
    cache: Mutex<HashMap<CacheKey, Arc<ScaledWatermark>>>,
    failure_logged: AtomicBool,
}

impl WatermarkSpec {
    pub fn new(image: RgbaImage, mode: WatermarkMode) -> Self {
        Self::shared(Arc::new(image), mode)
    }

    fn shared(image: Arc<RgbaImage>, mode: WatermarkMode) -> Self {
        Self {
            image,
            mode,
            cache: Mutex::new(HashMap::new()),
            failure_logged: AtomicBool::new(false),
        }
    }

    /// Decode PNG bytes into a watermark
    pub fn from_png_bytes(bytes: &[u8], mode: WatermarkMode) -> Result<Self, CompositeError> {
        Ok(Self::new(decode_png(bytes)?, mode))
    }

    /// Same image under another mode, with a fresh cache
    pub fn with_mode(&self, mode: WatermarkMode) -> Self {
        Self::shared(self.image.clone(), mode)
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn mode(&self) -> WatermarkMode {
        self.mode
    }

    /// Drop all cached scaled overlays
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_sizes(&self) -> usize {
        self.cache.lock().len()
    }

    /// Scaled overlay for a frame size, computed on first use
    pub fn scaled_for(
        &self,
        frame_width: u32,
        frame_height: u32,
        filter: ScaleFilter,
    ) -> Result<Arc<ScaledWatermark>, CompositeError> {
        let key = (frame_width, frame_height, filter);
        if let Some(scaled) = self.cache.lock().get(&key) {
            return Ok(scaled.clone());
        }

        let placement = Placement::compute(
            self.mode,
            frame_width,
            frame_height,
            self.image.width,
            self.image.height,
        )
        .ok_or_else(|| {
            CompositeError::InvalidImage(format!(
                "cannot place {}x{} watermark on {}x{} frame",
                self.image.width, self.image.height, frame_width, frame_height
            ))
        })?;

        let pixels = scale::scale_premultiplied(&self.image, placement.width, placement.height, filter)?;
        let scaled = Arc::new(ScaledWatermark { placement, pixels });

        tracing::debug!(
            "Scaled watermark for {}x{} frame: {}x{} at ({}, {} from bottom), {:?}",
            frame_width,
            frame_height,
            placement.width,
            placement.height,
            placement.x,
            placement.y,
            self.mode
        );

        self.cache.lock().insert(key, scaled.clone());
        Ok(scaled)
    }

    /// Log a compositing failure once per watermark
    pub(crate) fn log_failure(&self, err: &CompositeError) {
        if !self.failure_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!("Watermark skipped, passing frames through: {}", err);
        }
    }
}

/// Strategy that draws a watermark onto a frame
///
/// Implementations return a new frame and leave the input untouched. With
/// no watermark the result must share the input's pixel buffer.
pub trait WatermarkCompositor: Send + Sync {
    fn name(&self) -> &'static str;

    fn composite(&self, frame: &VideoFrame, watermark: Option<&WatermarkSpec>) -> VideoFrame;
}
