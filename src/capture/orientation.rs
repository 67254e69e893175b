//! Orientation handling
//!
//! Maps the device rotation and camera facing to the clockwise rotation that
//! turns sensor frames upright, and applies rotation + mirroring to frames as
//! a single pixel transform.

use super::traits::{VideoFrame, BYTES_PER_PIXEL};
use serde::{Deserialize, Serialize};

/// Clockwise rotation in quarter turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Parse a rotation in degrees. Only exact quarter turns are recognised;
    /// negative and >= 360 values are normalised first.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether width and height trade places
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

/// Resolve the rotation hint for a device rotation and camera facing.
///
/// Unknown device rotations resolve like 0°.
pub fn resolve(device_rotation_deg: i32, is_front_facing: bool) -> Rotation {
    let device = Rotation::from_degrees(device_rotation_deg).unwrap_or(Rotation::Deg0);
    match (device, is_front_facing) {
        (Rotation::Deg0, false) => Rotation::Deg90,
        (Rotation::Deg0, true) => Rotation::Deg270,
        (Rotation::Deg90, false) => Rotation::Deg0,
        (Rotation::Deg90, true) => Rotation::Deg180,
        (Rotation::Deg180, false) => Rotation::Deg270,
        (Rotation::Deg180, true) => Rotation::Deg90,
        (Rotation::Deg270, false) => Rotation::Deg180,
        (Rotation::Deg270, true) => Rotation::Deg0,
    }
}

/// Combined rotation + horizontal mirror, mirror applied after rotating
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTransform {
    pub rotation: Rotation,
    pub mirror: bool,
}

impl FrameTransform {
    pub const IDENTITY: FrameTransform = FrameTransform {
        rotation: Rotation::Deg0,
        mirror: false,
    };

    pub fn rotate(rotation: Rotation) -> Self {
        Self {
            rotation,
            mirror: false,
        }
    }

    pub fn mirror() -> Self {
        Self {
            rotation: Rotation::Deg0,
            mirror: true,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Output dimensions for an input of `width` x `height`
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.rotation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Source pixel for destination pixel `(dx, dy)`
    fn source_coord(&self, dx: u32, dy: u32, width: u32, height: u32) -> (u32, u32) {
        let (out_w, _) = self.output_size(width, height);
        let dx = if self.mirror { out_w - 1 - dx } else { dx };
        match self.rotation {
            Rotation::Deg0 => (dx, dy),
            Rotation::Deg90 => (dy, height - 1 - dx),
            Rotation::Deg180 => (width - 1 - dx, height - 1 - dy),
            Rotation::Deg270 => (width - 1 - dy, dx),
        }
    }

    /// Apply to a raw RGBA buffer, returning the new buffer and dimensions
    pub fn apply_pixels(&self, src: &[u8], width: u32, height: u32) -> (Vec<u8>, u32, u32) {
        let (out_w, out_h) = self.output_size(width, height);
        if self.is_identity() || width == 0 || height == 0 {
            return (src.to_vec(), out_w, out_h);
        }

        let mut out = vec![0u8; out_w as usize * out_h as usize * BYTES_PER_PIXEL];
        for dy in 0..out_h {
            for dx in 0..out_w {
                let (sx, sy) = self.source_coord(dx, dy, width, height);
                let src_idx = (sy as usize * width as usize + sx as usize) * BYTES_PER_PIXEL;
                let dst_idx = (dy as usize * out_w as usize + dx as usize) * BYTES_PER_PIXEL;
                if src_idx + BYTES_PER_PIXEL > src.len() {
                    continue;
                }
                out[dst_idx..dst_idx + BYTES_PER_PIXEL]
                    .copy_from_slice(&src[src_idx..src_idx + BYTES_PER_PIXEL]);
            }
        }
        (out, out_w, out_h)
    }

    /// Apply to a frame. The identity transform returns the same buffer.
    pub fn apply(&self, frame: &VideoFrame) -> VideoFrame {
        if self.is_identity() {
            return frame.clone();
        }
        let (data, w, h) = self.apply_pixels(frame.pixels(), frame.width, frame.height);
        frame.with_pixels(data, w, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::CameraFacing;
    use std::time::Duration;

    #[test]
    fn test_resolve_table() {
        let expected = [
            (0, false, 90),
            (0, true, 270),
            (90, false, 0),
            (90, true, 180),
            (180, false, 270),
            (180, true, 90),
            (270, false, 180),
            (270, true, 0),
        ];
        for (rotation, front, hint) in expected {
            assert_eq!(
                resolve(rotation, front).degrees(),
                hint,
                "rotation={} front={}",
                rotation,
                front
            );
        }
    }

    #[test]
    fn test_unknown_rotation_uses_zero_row() {
        assert_eq!(resolve(45, false), Rotation::Deg90);
        assert_eq!(resolve(45, true), Rotation::Deg270);
        assert_eq!(resolve(-90, false), resolve(270, false));
    }

    /// 2x1 image: red then green
    fn two_pixels() -> Vec<u8> {
        vec![255, 0, 0, 255, 0, 255, 0, 255]
    }

    #[test]
    fn test_rotate_90_clockwise() {
        let (out, w, h) = FrameTransform::rotate(Rotation::Deg90).apply_pixels(&two_pixels(), 2, 1);
        assert_eq!((w, h), (1, 2));
        // Left pixel ends up on top after a clockwise quarter turn
        assert_eq!(&out[0..4], &[255, 0, 0, 255]);
        assert_eq!(&out[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_rotate_270_clockwise() {
        let (out, w, h) = FrameTransform::rotate(Rotation::Deg270).apply_pixels(&two_pixels(), 2, 1);
        assert_eq!((w, h), (1, 2));
        assert_eq!(&out[0..4], &[0, 255, 0, 255]);
        assert_eq!(&out[4..8], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_mirror() {
        let (out, w, h) = FrameTransform::mirror().apply_pixels(&two_pixels(), 2, 1);
        assert_eq!((w, h), (2, 1));
        assert_eq!(&out[0..4], &[0, 255, 0, 255]);
        assert_eq!(&out[4..8], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_rotate_180_twice_is_identity() {
        let src: Vec<u8> = (0..24).collect();
        let t = FrameTransform::rotate(Rotation::Deg180);
        let (once, w, h) = t.apply_pixels(&src, 3, 2);
        let (twice, _, _) = t.apply_pixels(&once, w, h);
        assert_eq!(twice, src);
    }

    #[test]
    fn test_identity_keeps_buffer() {
        let frame = VideoFrame::new(two_pixels(), 2, 1, Duration::ZERO, CameraFacing::Back);
        let out = FrameTransform::IDENTITY.apply(&frame);
        assert!(out.shares_buffer(&frame));
    }
}
