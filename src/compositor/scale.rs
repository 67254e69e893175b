//! Watermark scaling to premultiplied RGBA

use super::{CompositeError, RgbaImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleFilter {
    Nearest,
    #[default]
    Bilinear,
}

fn premultiply(px: &[u8]) -> [f32; 4] {
    let a = px[3] as f32 / 255.0;
    [px[0] as f32 * a, px[1] as f32 * a, px[2] as f32 * a, px[3] as f32]
}

/// Scale `image` to `width`x`height` and premultiply by alpha
///
/// Filtering happens on premultiplied values so transparent pixels do not
/// bleed their color into opaque neighbours.
pub fn scale_premultiplied(
    image: &RgbaImage,
    width: u32,
    height: u32,
    filter: ScaleFilter,
) -> Result<Vec<u8>, CompositeError> {
    if width == 0 || height == 0 {
        return Err(CompositeError::InvalidImage(format!(
            "cannot scale to {}x{}",
            width, height
        )));
    }
    let (src_w, src_h) = (image.width as usize, image.height as usize);
    if src_w == 0 || src_h == 0 || image.data.len() != src_w * src_h * 4 {
        return Err(CompositeError::InvalidImage(format!(
            "watermark buffer does not match {}x{}",
            image.width, image.height
        )));
    }

    let sample = |x: usize, y: usize| premultiply(&image.data[(y * src_w + x) * 4..][..4]);
    let mut out = Vec::with_capacity(width as usize * height as usize * 4);

    let x_ratio = src_w as f64 / width as f64;
    let y_ratio = src_h as f64 / height as f64;

    for dy in 0..height as usize {
        for dx in 0..width as usize {
            let px = match filter {
                ScaleFilter::Nearest => {
                    let sx = ((dx as f64 * x_ratio) as usize).min(src_w - 1);
                    let sy = ((dy as f64 * y_ratio) as usize).min(src_h - 1);
                    sample(sx, sy)
                }
                ScaleFilter::Bilinear => {
                    // Pixel centres map onto pixel centres
                    let fx = ((dx as f64 + 0.5) * x_ratio - 0.5).clamp(0.0, (src_w - 1) as f64);
                    let fy = ((dy as f64 + 0.5) * y_ratio - 0.5).clamp(0.0, (src_h - 1) as f64);
                    let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
                    let (x1, y1) = ((x0 + 1).min(src_w - 1), (y0 + 1).min(src_h - 1));
                    let (tx, ty) = ((fx - x0 as f64) as f32, (fy - y0 as f64) as f32);

                    let (p00, p10, p01, p11) =
                        (sample(x0, y0), sample(x1, y0), sample(x0, y1), sample(x1, y1));
                    let mut px = [0.0f32; 4];
                    for c in 0..4 {
                        let top = p00[c] + (p10[c] - p00[c]) * tx;
                        let bottom = p01[c] + (p11[c] - p01[c]) * tx;
                        px[c] = top + (bottom - top) * ty;
                    }
                    px
                }
            };
            out.extend(px.iter().map(|v| v.round().clamp(0.0, 255.0) as u8));
        }
    }

    Ok(out)
}
