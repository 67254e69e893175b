//! CPU compositor: alpha-blends the scaled watermark into a copy of the frame

use super::{ScaleFilter, ScaledWatermark, WatermarkCompositor, WatermarkMode, WatermarkSpec};
use crate::capture::{FrameTransform, VideoFrame};

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuCompositor {
    filter: ScaleFilter,
}

impl CpuCompositor {
    pub fn new(filter: ScaleFilter) -> Self {
        Self { filter }
    }

    /// Transform applied to the frame before the watermark goes on
    pub fn frame_transform(mode: WatermarkMode, frame: &VideoFrame) -> FrameTransform {
        if mode == WatermarkMode::Fullscreen && frame.facing.is_front() {
            FrameTransform::mirror()
        } else {
            FrameTransform::IDENTITY
        }
    }
}

/// Source-over blend of premultiplied `scaled` onto straight RGBA `frame`
fn blend(frame: &mut [u8], frame_width: u32, frame_height: u32, scaled: &ScaledWatermark) {
    let p = scaled.placement;
    let top = p.top_row(frame_height);

    for wy in 0..p.height {
        let fy = top + wy as i64;
        if fy < 0 || fy >= frame_height as i64 {
            continue;
        }

        for wx in 0..p.width {
            let fx = p.x + wx;
            if fx >= frame_width {
                break;
            }

            let src_idx = ((wy * p.width + wx) * 4) as usize;
            let dst_idx = ((fy as u32 * frame_width + fx) * 4) as usize;
            let src = &scaled.pixels[src_idx..src_idx + 4];
            let dst = &mut frame[dst_idx..dst_idx + 4];

            let alpha = src[3] as u32;
            if alpha == 0 {
                continue;
            }
            if alpha == 255 {
                dst.copy_from_slice(src);
                continue;
            }

            let inv = 255 - alpha;
            for c in 0..4 {
                dst[c] = (src[c] as u32 + (dst[c] as u32 * inv + 127) / 255).min(255) as u8;
            }
        }
    }
}

impl WatermarkCompositor for CpuCompositor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn composite(&self, frame: &VideoFrame, watermark: Option<&WatermarkSpec>) -> VideoFrame {
        let Some(spec) = watermark else {
            return frame.clone();
        };
        if !frame.is_valid() {
            tracing::debug!(
                "Skipping watermark on malformed {}x{} frame",
                frame.width,
                frame.height
            );
            return frame.clone();
        }

        let transform = Self::frame_transform(spec.mode(), frame);
        let (width, height) = transform.output_size(frame.width, frame.height);

        let scaled = match spec.scaled_for(width, height, self.filter) {
            Ok(scaled) => scaled,
            Err(e) => {
                spec.log_failure(&e);
                return frame.clone();
            }
        };

        let mut pixels = if transform.is_identity() {
            frame.pixels().to_vec()
        } else {
            transform.apply_pixels(frame.pixels(), frame.width, frame.height).0
        };

        blend(&mut pixels, width, height, &scaled);
        frame.with_pixels(pixels, width, height)
    }
}
