//! Artifact rendering: the square caption card and the vertical story frame.
//!
//! Both renderers are pure: a decoded raster goes in, PNG bytes come out.

pub mod square;
pub mod vertical;

use crate::config::Branding;
use ab_glyph::FontArc;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, sync::Arc};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("source image has no pixels")]
    EmptyImage,
    #[error("png encoding failed: {0}")]
    Encode(String),
}

/// DejaVu Sans Bold, used unless the branding file names another font.
const BUNDLED_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans-Bold.ttf");

#[derive(Clone)]
pub struct Compositor {
    captions: Option<Arc<square::Captions>>,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(&Branding::default())
    }
}

impl Compositor {
    pub fn new(branding: &Branding) -> Self {
        let captions = load_font(branding).map(|font| Arc::new(square::Captions::new(font, branding)));
        Self { captions }
    }

    pub fn has_captions(&self) -> bool {
        self.captions.is_some()
    }

    pub fn compose_square(&self, image: &DynamicImage) -> Result<Vec<u8>, CompositionError> {
        ensure_pixels(image)?;
        encode_png(square::render(image, self.captions.as_deref()))
    }

    pub fn compose_vertical(&self, image: &DynamicImage) -> Result<Vec<u8>, CompositionError> {
        ensure_pixels(image)?;
        encode_png(vertical::render(image))
    }
}

/// The configured font when it loads, otherwise the bundled one.
fn load_font(branding: &Branding) -> Option<FontArc> {
    if let Some(path) = branding.font_path.as_ref() {
        match std::fs::read(path) {
            Ok(bytes) => match FontArc::try_from_vec(bytes) {
                Ok(font) => return Some(font),
                Err(err) => {
                    warn!(target = "sorteio.compositor", path = %path.display(), error = %err, "caption font invalid; using bundled font");
                }
            },
            Err(err) => {
                warn!(target = "sorteio.compositor", path = %path.display(), error = %err, "caption font unreadable; using bundled font");
            }
        }
    }
    match FontArc::try_from_slice(BUNDLED_FONT) {
        Ok(font) => Some(font),
        Err(err) => {
            warn!(target = "sorteio.compositor", error = %err, "bundled font invalid; captions disabled");
            None
        }
    }
}

fn ensure_pixels(image: &DynamicImage) -> Result<(), CompositionError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(CompositionError::EmptyImage);
    }
    Ok(())
}

pub(crate) fn white_canvas(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([255, 255, 255]))
}

/// Pastes `content` centered on `canvas`.
pub(crate) fn paste_centered(canvas: &mut RgbImage, content: &RgbImage) {
    let x = (i64::from(canvas.width()) - i64::from(content.width())) / 2;
    let y = (i64::from(canvas.height()) - i64::from(content.height())) / 2;
    image::imageops::replace(canvas, content, x, y);
}

pub fn encode_png(canvas: RgbImage) -> Result<Vec<u8>, CompositionError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|err| CompositionError::Encode(err.to_string()))?;
    Ok(out.into_inner())
}
