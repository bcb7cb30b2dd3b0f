use crate::candidates::ImageCandidate;
use image::{DynamicImage, GenericImageView, RgbImage};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A channel must exceed this to count as white.
pub const WHITE_CHANNEL_FLOOR: u8 = 240;
pub const MIN_WHITE_RATIO: f64 = 0.60;
const BORDER_FRACTION: f64 = 0.10;
const SAMPLE_STEP: usize = 5;

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("no suitable image: {0}")]
    NoSuitableImage(String),
}

#[derive(Debug, Clone)]
pub struct EvaluatedCandidate {
    pub candidate: ImageCandidate,
    pub image: DynamicImage,
    pub white_ratio: f64,
    pub width: u32,
    pub height: u32,
    pub score: u32,
}

#[derive(Clone)]
pub struct CandidateEvaluator {
    client: Client,
    max_bytes: usize,
}

impl CandidateEvaluator {
    pub fn new(client: Client, max_bytes: usize) -> Self {
        Self { client, max_bytes }
    }

    /// Fetches and scores candidates one at a time, in discovery order.
    pub async fn select_best(
        &self,
        candidates: &[ImageCandidate],
    ) -> Result<EvaluatedCandidate, EvaluateError> {
        let mut passing = Vec::new();
        let mut rejections = Vec::new();

        for candidate in candidates {
            let bytes = match self.fetch_image(&candidate.url).await {
                Ok(bytes) => bytes,
                Err(reason) => {
                    warn!(target = "sorteio.evaluator", url = %candidate.url, %reason, "candidate fetch failed");
                    rejections.push(format!("{}: {reason}", candidate.url));
                    continue;
                }
            };
            let assessed = tokio::task::spawn_blocking(move || assess(&bytes)).await;
            match assessed {
                Ok(Ok(assessment)) => {
                    crate::metrics::candidate_scored(
                        candidate.method.tier(),
                        assessment.white_ratio,
                        assessment.score,
                    );
                    match assessment.score {
                        Some(score) => {
                            debug!(
                                target = "sorteio.evaluator",
                                url = %candidate.url,
                                white_ratio = assessment.white_ratio,
                                width = assessment.width,
                                height = assessment.height,
                                score,
                                "candidate passed"
                            );
                            passing.push(EvaluatedCandidate {
                                candidate: candidate.clone(),
                                width: assessment.width,
                                height: assessment.height,
                                white_ratio: assessment.white_ratio,
                                image: assessment.image,
                                score,
                            });
                        }
                        None => rejections.push(format!(
                            "{}: white ratio {:.0}% below threshold",
                            candidate.url,
                            assessment.white_ratio * 100.0
                        )),
                    }
                }
                Ok(Err(reason)) => rejections.push(format!("{}: {reason}", candidate.url)),
                Err(err) => rejections.push(format!("{}: {err}", candidate.url)),
            }
        }

        let best = pick_best(passing).ok_or_else(|| {
            EvaluateError::NoSuitableImage(if rejections.is_empty() {
                "no candidates to evaluate".to_string()
            } else {
                rejections.join("; ")
            })
        })?;
        info!(
            target = "sorteio.evaluator",
            url = %best.candidate.url,
            score = best.score,
            white_ratio = best.white_ratio,
            "candidate selected"
        );
        Ok(best)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_bytes)
        {
            return Err("image too large".to_string());
        }
        let bytes = response.bytes().await.map_err(|err| err.to_string())?;
        if bytes.len() > self.max_bytes {
            return Err("image too large".to_string());
        }
        Ok(bytes.to_vec())
    }
}

struct Assessment {
    image: DynamicImage,
    white_ratio: f64,
    width: u32,
    height: u32,
    score: Option<u32>,
}

fn assess(bytes: &[u8]) -> Result<Assessment, String> {
    let image = image::load_from_memory(bytes).map_err(|err| format!("decode failed: {err}"))?;
    let (width, height) = image.dimensions();
    let white_ratio = white_ratio(&flatten_on_white(&image));
    Ok(Assessment {
        score: score(white_ratio, width, height),
        image,
        white_ratio,
        width,
        height,
    })
}

/// Composites any alpha channel over white.
pub fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| -> u8 {
            let a = u32::from(a);
            ((u32::from(c) * a + 255 * (255 - a) + 127) / 255) as u8
        };
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Fraction of near-white pixels sampled along a border band.
///
/// The band is 10% of the shorter side thick. Top and bottom bands are
/// scanned along x, left and right along y, taking every 5th pixel along the
/// scan axis and every pixel across the band.
pub fn white_ratio(image: &RgbImage) -> f64 {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let band = ((f64::from(w.min(h)) * BORDER_FRACTION).floor() as u32).max(1);
    let mut white = 0usize;
    let mut sampled = 0usize;
    let mut sample = |x: u32, y: u32| {
        sampled += 1;
        if image.get_pixel(x, y).0.iter().all(|c| *c > WHITE_CHANNEL_FLOOR) {
            white += 1;
        }
    };

    for y in (0..band).chain(h - band..h) {
        for x in (0..w).step_by(SAMPLE_STEP) {
            sample(x, y);
        }
    }
    for x in (0..band).chain(w - band..w) {
        for y in (0..h).step_by(SAMPLE_STEP) {
            sample(x, y);
        }
    }

    white as f64 / sampled as f64
}

/// Whiteness tier dominates the resolution bonus; `None` means rejected.
pub fn score(white_ratio: f64, width: u32, height: u32) -> Option<u32> {
    if white_ratio < MIN_WHITE_RATIO {
        return None;
    }
    let whiteness = if white_ratio >= 0.80 {
        500
    } else if white_ratio >= 0.70 {
        300
    } else {
        100
    };
    let resolution = if width >= 800 && height >= 800 {
        200
    } else if width >= 400 && height >= 400 {
        100
    } else {
        0
    };
    Some(1000 + whiteness + resolution)
}

/// Highest score wins; equal scores keep the earlier discovery.
pub fn pick_best(evaluated: Vec<EvaluatedCandidate>) -> Option<EvaluatedCandidate> {
    let mut best: Option<EvaluatedCandidate> = None;
    for item in evaluated {
        let replace = match &best {
            None => true,
            Some(current) => {
                item.score > current.score
                    || (item.score == current.score && item.candidate.order < current.candidate.order)
            }
        };
        if replace {
            best = Some(item);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::DiscoveryMethod;
    use image::{ImageFormat, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate(url: &str, order: usize) -> ImageCandidate {
        ImageCandidate {
            url: url.to_string(),
            method: DiscoveryMethod::ImageTag,
            order,
        }
    }

    fn evaluated(order: usize, ratio: f64, w: u32, h: u32) -> EvaluatedCandidate {
        EvaluatedCandidate {
            candidate: candidate(&format!("https://img.test/{order}.png"), order),
            image: DynamicImage::new_rgb8(1, 1),
            white_ratio: ratio,
            width: w,
            height: h,
            score: score(ratio, w, h).expect("passing"),
        }
    }

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).expect("encode");
        out.into_inner()
    }

    #[test]
    fn pure_white_scores_full_marks() {
        let img = RgbImage::from_pixel(1000, 1000, Rgb([255, 255, 255]));
        assert_eq!(white_ratio(&img), 1.0);
        assert_eq!(score(1.0, 1000, 1000), Some(1700));
    }

    #[test]
    fn border_band_sampling_counts_each_edge() {
        let mut img = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        for y in 0..100 {
            for x in 0..10 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        // 800 samples; the dark left band costs 200 plus 40 corner samples.
        let ratio = white_ratio(&img);
        assert!((ratio - 0.70).abs() < 1e-9, "{ratio}");
    }

    #[test]
    fn channel_must_exceed_240() {
        let at_floor = RgbImage::from_pixel(50, 50, Rgb([240, 255, 255]));
        assert_eq!(white_ratio(&at_floor), 0.0);
        let above = RgbImage::from_pixel(50, 50, Rgb([241, 241, 241]));
        assert_eq!(white_ratio(&above), 1.0);
    }

    #[test]
    fn score_thresholds_are_inclusive_at_tier_boundaries() {
        assert_eq!(score(0.5999, 2000, 2000), None);
        assert_eq!(score(0.60, 100, 100), Some(1100));
        assert_eq!(score(0.6999, 400, 400), Some(1200));
        assert_eq!(score(0.70, 400, 400), Some(1400));
        assert_eq!(score(0.7999, 800, 800), Some(1500));
        assert_eq!(score(0.80, 800, 799), Some(1600));
        assert_eq!(score(0.80, 399, 4000), Some(1500));
    }

    #[test]
    fn dark_background_is_rejected_regardless_of_resolution() {
        let img = RgbImage::from_pixel(4000, 4000, Rgb([30, 30, 30]));
        assert_eq!(score(white_ratio(&img), 4000, 4000), None);
    }

    #[test]
    fn whiteness_tier_beats_resolution() {
        let whiter_small = evaluated(1, 0.85, 300, 300);
        let greyer_large = evaluated(0, 0.65, 3000, 3000);
        let best = pick_best(vec![greyer_large, whiter_small]).expect("best");
        assert_eq!(best.candidate.order, 1);
        assert_eq!(best.score, 1500);
    }

    #[test]
    fn ties_keep_discovery_order() {
        let first = evaluated(0, 0.9, 1000, 1000);
        let second = evaluated(1, 0.95, 1200, 1200);
        let best = pick_best(vec![second, first]).expect("best");
        assert_eq!(best.candidate.order, 0);
    }

    #[test]
    fn transparent_background_counts_as_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(60, 60, Rgba([0, 0, 0, 0])));
        assert_eq!(white_ratio(&flatten_on_white(&img)), 1.0);
    }

    #[tokio::test]
    async fn select_best_skips_failed_fetches() {
        let server = MockServer::start().await;
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(900, 900, Rgb([255, 255, 255])));
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.png"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not an image"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/white.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes(&white)),
            )
            .mount(&server)
            .await;

        let evaluator = CandidateEvaluator::new(Client::new(), 1024 * 1024);
        let candidates = vec![
            candidate(&format!("{}/missing.png", server.uri()), 0),
            candidate(&format!("{}/broken.png", server.uri()), 1),
            candidate(&format!("{}/white.png", server.uri()), 2),
        ];
        let best = evaluator.select_best(&candidates).await.expect("best");
        assert_eq!(best.candidate.order, 2);
        assert_eq!(best.score, 1700);
        assert_eq!((best.width, best.height), (900, 900));
    }

    #[tokio::test]
    async fn select_best_reports_when_nothing_passes() {
        let server = MockServer::start().await;
        let dark = DynamicImage::ImageRgb8(RgbImage::from_pixel(500, 500, Rgb([10, 10, 10])));
        Mock::given(method("GET"))
            .and(path("/dark.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes(&dark)))
            .mount(&server)
            .await;

        let evaluator = CandidateEvaluator::new(Client::new(), 1024 * 1024);
        let candidates = vec![candidate(&format!("{}/dark.png", server.uri()), 0)];
        let err = evaluator.select_best(&candidates).await.unwrap_err();
        let EvaluateError::NoSuitableImage(reason) = err;
        assert!(reason.contains("below threshold"), "{reason}");
    }
}
