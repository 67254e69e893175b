//! PNG decode/encode for watermark assets and snapshots

use super::CompositeError;
use std::io::{BufWriter, Read};
use std::path::Path;

/// Straight-alpha RGBA8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbaImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CompositeError> {
        if width == 0 || height == 0 {
            return Err(CompositeError::InvalidImage(format!(
                "image has zero dimension: {}x{}",
                width, height
            )));
        }
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(CompositeError::InvalidImage(format!(
                "expected {} bytes for {}x{} RGBA, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Single-color image
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self { width, height, data }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Decode a PNG from any reader into RGBA8
pub fn decode_png<R: Read>(reader: R) -> Result<RgbaImage, CompositeError> {
    let mut decoder = png::Decoder::new(reader);
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder
        .read_info()
        .map_err(|e| CompositeError::Decode(format!("PNG decode error: {}", e)))?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| CompositeError::Decode(format!("PNG frame error: {}", e)))?;
    let raw = &buf[..info.buffer_size()];

    let data = match info.color_type {
        png::ColorType::Rgba => raw.to_vec(),
        png::ColorType::Rgb => {
            let mut rgba = Vec::with_capacity(raw.len() / 3 * 4);
            for chunk in raw.chunks(3) {
                rgba.extend_from_slice(chunk);
                rgba.push(255);
            }
            rgba
        }
        png::ColorType::GrayscaleAlpha => {
            let mut rgba = Vec::with_capacity(raw.len() * 2);
            for chunk in raw.chunks(2) {
                rgba.extend_from_slice(&[chunk[0], chunk[0], chunk[0], chunk[1]]);
            }
            rgba
        }
        png::ColorType::Grayscale => {
            let mut rgba = Vec::with_capacity(raw.len() * 4);
            for &v in raw {
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
            rgba
        }
        other => {
            return Err(CompositeError::Decode(format!(
                "Unsupported PNG color type: {:?}",
                other
            )));
        }
    };

    RgbaImage::new(info.width, info.height, data)
}

/// Load a PNG file as RGBA8
pub fn load_png(path: &Path) -> Result<RgbaImage, CompositeError> {
    let file = std::fs::File::open(path)?;
    decode_png(file)
}

/// Write RGBA8 pixels as a PNG file
pub fn write_png(path: &Path, width: u32, height: u32, rgba: &[u8]) -> Result<(), CompositeError> {
    let file = std::fs::File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);

    let mut writer = encoder
        .write_header()
        .map_err(|e| CompositeError::Encode(format!("PNG header error: {}", e)))?;
    writer
        .write_image_data(rgba)
        .map_err(|e| CompositeError::Encode(format!("PNG write error: {}", e)))?;
    writer
        .finish()
        .map_err(|e| CompositeError::Encode(format!("PNG finish error: {}", e)))?;
    Ok(())
}
