use super::{paste_centered, white_canvas};
use crate::evaluator::flatten_on_white;
use image::{DynamicImage, GrayImage, Luma, RgbImage, imageops::FilterType};
use imageproc::{distance_transform::Norm, morphology::dilate};

pub const VERTICAL_WIDTH: u32 = 1080;
pub const VERTICAL_HEIGHT: u32 = 1920;
/// Max channel distance from 255 above which a pixel is foreground.
const MASK_THRESHOLD: u8 = 18;
const MIN_BOX_SIDE: u32 = 10;
const PAD_FRACTION: f64 = 0.02;
const MARGIN_FRACTION: f64 = 0.05;
const CONTENT_MAX_WIDTH: f64 = 800.0;
const CONTENT_HEIGHT_CAP: f64 = 3000.0;
const LEGACY_BOX: (f64, f64) = (800.0, 1500.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn render(image: &DynamicImage) -> RgbImage {
    let flat = flatten_on_white(image);
    let crop = foreground_box(&flat);
    let scale = vertical_scale((flat.width(), flat.height()), (crop.width, crop.height));

    let region = image::imageops::crop_imm(&flat, crop.x, crop.y, crop.width, crop.height).to_image();
    let target_w = ((f64::from(crop.width) * scale).round() as u32).clamp(1, VERTICAL_WIDTH);
    let target_h = ((f64::from(crop.height) * scale).round() as u32).clamp(1, VERTICAL_HEIGHT);
    let content = image::imageops::resize(&region, target_w, target_h, FilterType::Lanczos3);

    let mut canvas = white_canvas(VERTICAL_WIDTH, VERTICAL_HEIGHT);
    paste_centered(&mut canvas, &content);
    canvas
}

pub fn foreground_mask(image: &RgbImage) -> GrayImage {
    let mask = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let distance = image
            .get_pixel(x, y)
            .0
            .iter()
            .map(|c| 255 - c)
            .max()
            .unwrap_or(0);
        Luma([if distance > MASK_THRESHOLD { 255 } else { 0 }])
    });
    dilate(&mask, Norm::LInf, 1)
}

/// Padded bounding box of the foreground, or the whole image when the
/// foreground is empty or too thin to trust.
pub fn foreground_box(image: &RgbImage) -> CropBox {
    let (width, height) = image.dimensions();
    let full = CropBox {
        x: 0,
        y: 0,
        width,
        height,
    };
    let mask = foreground_mask(image);

    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, px) in mask.enumerate_pixels() {
        if px.0[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    let Some((x0, y0, x1, y1)) = bounds else {
        return full;
    };
    if x1 - x0 + 1 < MIN_BOX_SIDE || y1 - y0 + 1 < MIN_BOX_SIDE {
        return full;
    }

    let pad = (f64::from(width.min(height)) * PAD_FRACTION).round() as u32;
    let left = x0.saturating_sub(pad);
    let top = y0.saturating_sub(pad);
    let right = (x1 + pad).min(width - 1);
    let bottom = (y1 + pad).min(height - 1);
    CropBox {
        x: left,
        y: top,
        width: right - left + 1,
        height: bottom - top + 1,
    }
}

/// Scale applied to the cropped region.
///
/// `legacy` fits the whole source into 800×1500; `fitted` fits the crop into
/// 800×min(3000, 1920 − 2·margin). The larger of `fitted` and twice `legacy`
/// is preferred, capped at `fitted`.
pub fn vertical_scale(full: (u32, u32), crop: (u32, u32)) -> f64 {
    let margin = (f64::from(VERTICAL_WIDTH.min(VERTICAL_HEIGHT)) * MARGIN_FRACTION).round();
    let max_height = CONTENT_HEIGHT_CAP.min(f64::from(VERTICAL_HEIGHT) - 2.0 * margin);
    let legacy = (LEGACY_BOX.0 / f64::from(full.0)).min(LEGACY_BOX.1 / f64::from(full.1));
    let fitted = (CONTENT_MAX_WIDTH / f64::from(crop.0)).min(max_height / f64::from(crop.1));
    fitted.max(2.0 * legacy).min(fitted)
}
