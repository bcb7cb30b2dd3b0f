use super::{paste_centered, white_canvas};
use crate::config::{Branding, CaptionSpec};
use crate::evaluator::flatten_on_white;
use ab_glyph::{Font, FontArc, GlyphId, PxScale, ScaleFont, point};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage, imageops::FilterType};
use imageproc::drawing::{draw_text_mut, text_size};

pub const SQUARE_SIZE: u32 = 600;
pub const SQUARE_MAX_CONTENT: u32 = 540;
const CAPTION_MARGIN: i32 = 20;

pub struct Captions {
    font: FontArc,
    upper: CaptionSpec,
    lower: CaptionSpec,
    fill: Rgb<u8>,
    outline: Rgb<u8>,
}

impl Captions {
    pub fn new(font: FontArc, branding: &Branding) -> Self {
        Self {
            font,
            upper: branding.upper.clone(),
            lower: branding.lower.clone(),
            fill: Rgb(branding.fill),
            outline: Rgb(branding.outline),
        }
    }
}

/// Target size for a scale-down-only fit inside a `max`×`max` box.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    let scale = (f64::from(max) / f64::from(width))
        .min(f64::from(max) / f64::from(height))
        .min(1.0);
    let w = ((f64::from(width) * scale).round() as u32).clamp(1, max);
    let h = ((f64::from(height) * scale).round() as u32).clamp(1, max);
    (w, h)
}

pub fn render(image: &DynamicImage, captions: Option<&Captions>) -> RgbImage {
    let (width, height) = image.dimensions();
    let (target_w, target_h) = fit_within(width, height, SQUARE_MAX_CONTENT);
    let flat = flatten_on_white(image);
    let content = if (target_w, target_h) == (width, height) {
        flat
    } else {
        image::imageops::resize(&flat, target_w, target_h, FilterType::Lanczos3)
    };

    let mut canvas = white_canvas(SQUARE_SIZE, SQUARE_SIZE);
    paste_centered(&mut canvas, &content);

    if let Some(captions) = captions {
        draw_caption(&mut canvas, captions, &captions.upper, CaptionAnchor::Top);
        draw_caption(&mut canvas, captions, &captions.lower, CaptionAnchor::Bottom);
    }
    canvas
}

enum CaptionAnchor {
    Top,
    Bottom,
}

fn draw_caption(canvas: &mut RgbImage, captions: &Captions, spec: &CaptionSpec, anchor: CaptionAnchor) {
    if spec.text.trim().is_empty() {
        return;
    }
    let scale = PxScale::from(spec.size);
    let (text_w, text_h) = text_size(scale, &captions.font, &spec.text);
    let x = match ink_extent(&captions.font, scale, &spec.text) {
        Some((min_x, max_x)) => {
            ((SQUARE_SIZE as f32 - (max_x - min_x)) / 2.0 - min_x).round() as i32
        }
        None => (SQUARE_SIZE as i32 - text_w as i32) / 2,
    };
    let y = match anchor {
        CaptionAnchor::Top => CAPTION_MARGIN,
        CaptionAnchor::Bottom => SQUARE_SIZE as i32 - CAPTION_MARGIN - text_h as i32,
    };
    draw_outlined_text(
        canvas,
        &captions.font,
        scale,
        &spec.text,
        (x, y),
        spec.outline_radius,
        captions.fill,
        captions.outline,
    );
}

/// Horizontal pixel span inked by `text` when drawn at x = 0, using the
/// same glyph layout as `draw_text_mut`.
fn ink_extent(font: &FontArc, scale: PxScale, text: &str) -> Option<(f32, f32)> {
    let scaled = font.as_scaled(scale);
    let mut pen = 0.0;
    let mut prev: Option<GlyphId> = None;
    let mut extent: Option<(f32, f32)> = None;
    for c in text.chars() {
        let id = scaled.glyph_id(c);
        let glyph = id.with_scale_and_position(scale, point(pen, scaled.ascent()));
        pen += scaled.h_advance(id);
        let Some(outlined) = scaled.outline_glyph(glyph) else {
            continue;
        };
        if let Some(prev) = prev {
            pen += scaled.kern(id, prev);
        }
        prev = Some(id);
        let bounds = outlined.px_bounds();
        let (lo, hi) = (bounds.min.x.round(), bounds.min.x.round() + bounds.width());
        extent = Some(match extent {
            Some((min_x, max_x)) => (min_x.min(lo), max_x.max(hi)),
            None => (lo, hi),
        });
    }
    extent
}

/// Stroke by stamping the text at every offset within `radius`, then fill.
#[allow(clippy::too_many_arguments)]
fn draw_outlined_text(
    canvas: &mut RgbImage,
    font: &FontArc,
    scale: PxScale,
    text: &str,
    (x, y): (i32, i32),
    radius: i32,
    fill: Rgb<u8>,
    outline: Rgb<u8>,
) {
    let radius = radius.max(0);
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            if dx == 0 && dy == 0 {
                continue;
            }
            draw_text_mut(canvas, outline, x + dx, y + dy, scale, font, text);
        }
    }
    draw_text_mut(canvas, fill, x, y, scale, font, text);
}
