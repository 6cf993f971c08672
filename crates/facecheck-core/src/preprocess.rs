//! Still-frame preprocessing for the embedding network.
//!
//! Crops the face (plus margin), fits it into the network's square input,
//! and decodes it to a row-major RGB `f32` buffer. The fitted crop goes
//! through a scratch PNG which is removed when this module returns.

use crate::runtime::InputSpec;
use crate::types::Bounds;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Margin added on every side of the detector's box, as a fraction of its size.
pub const FACE_MARGIN: f32 = 0.20;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("invalid face bounds: {0}")]
    InvalidBounds(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("scratch file: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// Pixel rectangle inside the still.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Expand `bounds` by [`FACE_MARGIN`] and clamp it to the image.
pub fn crop_rect(
    bounds: &Bounds,
    img_width: u32,
    img_height: u32,
) -> Result<CropRect, PreprocessError> {
    if !bounds.x.is_finite() || !bounds.y.is_finite() {
        return Err(PreprocessError::InvalidBounds("non-finite origin".into()));
    }
    if !(bounds.width > 0.0 && bounds.height > 0.0)
        || !bounds.width.is_finite()
        || !bounds.height.is_finite()
    {
        return Err(PreprocessError::InvalidBounds(format!(
            "size {}x{}",
            bounds.width, bounds.height
        )));
    }

    let mx = bounds.width * FACE_MARGIN;
    let my = bounds.height * FACE_MARGIN;
    let x0 = (bounds.x - mx).max(0.0);
    let y0 = (bounds.y - my).max(0.0);
    let x1 = (bounds.x + bounds.width + mx).min(img_width as f32);
    let y1 = (bounds.y + bounds.height + my).min(img_height as f32);

    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return Err(PreprocessError::InvalidBounds(format!(
            "crop ({x0:.0},{y0:.0})-({x1:.0},{y1:.0}) outside {img_width}x{img_height} image"
        )));
    }

    let x = x0.floor() as u32;
    let y = y0.floor() as u32;
    Ok(CropRect {
        x,
        y,
        width: (x1.ceil() as u32).min(img_width) - x,
        height: (y1.ceil() as u32).min(img_height) - y,
    })
}

/// Normalize packed RGB bytes to the network range.
pub fn normalize_pixels(rgb: &[u8], spec: &InputSpec) -> Result<Vec<f32>, PreprocessError> {
    if rgb.len() != spec.buffer_len() {
        return Err(PreprocessError::Decode(format!(
            "expected {} RGB values, got {}",
            spec.buffer_len(),
            rgb.len()
        )));
    }
    Ok(rgb
        .iter()
        .map(|&p| (p as f32 - spec.mean) / spec.std)
        .collect())
}

#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// `side * side * 3` values, row-major RGB.
    pub buffer: Vec<f32>,
    /// False when the face crop was rejected and the full frame was used.
    pub cropped: bool,
}

pub struct Preprocessor {
    spec: InputSpec,
    scratch_dir: PathBuf,
}

impl Preprocessor {
    pub fn new(spec: InputSpec, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn spec(&self) -> &InputSpec {
        &self.spec
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Load a still from disk and preprocess it.
    pub fn preprocess(
        &self,
        still: &Path,
        bounds: Option<&Bounds>,
    ) -> Result<Preprocessed, PreprocessError> {
        let image = image::open(still)
            .map_err(|e| PreprocessError::Decode(format!("{}: {e}", still.display())))?;
        self.preprocess_image(&image, bounds)
    }

    /// Preprocess an in-memory still. An unusable face box falls back to the full frame.
    pub fn preprocess_image(
        &self,
        image: &DynamicImage,
        bounds: Option<&Bounds>,
    ) -> Result<Preprocessed, PreprocessError> {
        let (width, height) = image.dimensions();
        let rect = match bounds.map(|b| crop_rect(b, width, height)).transpose() {
            Ok(rect) => rect,
            Err(e) => {
                tracing::warn!(error = %e, width, height, "face crop rejected; using full frame");
                None
            }
        };

        let buffer = self.render(image, rect)?;
        Ok(Preprocessed {
            buffer,
            cropped: rect.is_some(),
        })
    }

    fn render(
        &self,
        image: &DynamicImage,
        rect: Option<CropRect>,
    ) -> Result<Vec<f32>, PreprocessError> {
        let region = match rect {
            Some(r) => image.crop_imm(r.x, r.y, r.width, r.height),
            None => image.clone(),
        };
        if region.width() == 0 || region.height() == 0 {
            return Err(PreprocessError::Decode("empty image".into()));
        }

        // "Contain" fit, letterboxed with the mean so padding normalizes to ~0.
        let side = self.spec.side as u32;
        let fitted = region.resize(side, side, FilterType::Triangle).to_rgb8();
        let pad = self.spec.mean.round().clamp(0.0, 255.0) as u8;
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([pad, pad, pad]));
        let ox = (side - fitted.width().min(side)) / 2;
        let oy = (side - fitted.height().min(side)) / 2;
        imageops::overlay(&mut canvas, &fitted, ox as i64, oy as i64);

        let mut scratch = tempfile::Builder::new()
            .prefix("facecheck-crop-")
            .suffix(".png")
            .tempfile_in(&self.scratch_dir)?;
        DynamicImage::ImageRgb8(canvas).write_to(scratch.as_file_mut(), ImageFormat::Png)?;

        let decoded = image::open(scratch.path())
            .map_err(|e| PreprocessError::Decode(e.to_string()))?
            .to_rgb8()
            .into_raw();

        tracing::trace!(side, cropped = rect.is_some(), "decoded fitted crop");
        normalize_pixels(&decoded, &self.spec)
    }
}
