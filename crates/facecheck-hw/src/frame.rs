//! Frame type and pixel conversion: YUYV/GREY to RGB, dark detection, still encoding.

use image::{ImageFormat, RgbImage};
use std::path::Path;
use tempfile::TempPath;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let luma = rgb_luma(&self.data);
        if luma.is_empty() {
            return 0.0;
        }
        luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
    }

    /// Encode as JPEG into a temporary file under `dir`. The file goes away
    /// when the returned path is dropped.
    pub fn write_still(&self, dir: &Path) -> Result<TempPath, FrameError> {
        let img = RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width * self.height * 3) as usize,
                actual: self.data.len(),
            },
        )?;
        let mut file = tempfile::Builder::new()
            .prefix("facecheck-still-")
            .suffix(".jpg")
            .tempfile_in(dir)?;
        img.write_to(file.as_file_mut(), ImageFormat::Jpeg)?;
        Ok(file.into_temp_path())
    }
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert packed YUYV (4:2:2) to RGB using full-range BT.601.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

/// Replicate 8-bit grey into RGB.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    Ok(grey[..expected].iter().flat_map(|&g| [g, g, g]).collect())
}

/// BT.601 luma of packed RGB.
pub fn rgb_luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|p| clamp_u8(0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32))
        .collect()
}

/// True if more than `threshold_pct` of pixels are below luma 32.
pub fn is_dark_frame(luma: &[u8], threshold_pct: f32) -> bool {
    if luma.is_empty() {
        return true;
    }
    let dark_count = luma.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / luma.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("still file: {0}")]
    Io(#[from] std::io::Error),
    #[error("still encoding: {0}")]
    Encode(#[from] image::ImageError),
}
