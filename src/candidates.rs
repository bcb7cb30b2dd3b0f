//! Candidate image discovery for a product page.
//!
//! A page is fetched once and scanned by an ordered chain of strategies. Each
//! strategy belongs to a fixed tier; lower tiers are tried first and the last
//! two tiers only run when everything before them came up empty.

use crate::product_code::code_variants;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum FinderError {
    #[error("failed to fetch `{url}`: {detail}")]
    Fetch { url: String, detail: String },
    #[error("no image candidates: {0}")]
    NoCandidates(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    CdnPattern,
    ImageTag,
    Preload,
    Gallery,
    MetaImage,
}

impl DiscoveryMethod {
    pub fn tier(self) -> u8 {
        match self {
            DiscoveryMethod::CdnPattern => 0,
            DiscoveryMethod::ImageTag => 1,
            DiscoveryMethod::Preload => 2,
            DiscoveryMethod::Gallery => 3,
            DiscoveryMethod::MetaImage => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageCandidate {
    pub url: String,
    pub method: DiscoveryMethod,
    /// Position in discovery order; breaks score ties.
    pub order: usize,
}

struct PageContext<'a> {
    raw: &'a str,
    doc: &'a Html,
    code_variants: [String; 2],
    cdn: Option<&'a Regex>,
}

struct Strategy {
    method: DiscoveryMethod,
    fallback_only: bool,
    run: fn(&PageContext<'_>) -> Vec<String>,
}

const STRATEGIES: &[Strategy] = &[
    Strategy {
        method: DiscoveryMethod::CdnPattern,
        fallback_only: false,
        run: cdn_pattern_urls,
    },
    Strategy {
        method: DiscoveryMethod::ImageTag,
        fallback_only: false,
        run: image_tag_urls,
    },
    Strategy {
        method: DiscoveryMethod::Preload,
        fallback_only: false,
        run: preload_and_structured_urls,
    },
    Strategy {
        method: DiscoveryMethod::Gallery,
        fallback_only: true,
        run: gallery_urls,
    },
    Strategy {
        method: DiscoveryMethod::MetaImage,
        fallback_only: true,
        run: meta_image_urls,
    },
];

static BACKGROUND_URL: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?i)background(?:-image)?\s*:\s*url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).ok()
});

const IMAGE_ATTRIBUTES: &[&str] = &[
    "src",
    "data-src",
    "data-lazy",
    "data-lazy-src",
    "data-zoom",
    "data-original",
];

const SRCSET_ATTRIBUTES: &[&str] = &["srcset", "data-srcset"];

const GALLERY_SELECTORS: &str = ".ui-pdp-gallery img, figure img, .swiper-slide img, .slick-slide img, [data-gallery] img, .gallery img, .slideshow img";

const META_IMAGE_SELECTORS: &str = r#"meta[property="og:image"], meta[property="og:image:secure_url"], meta[name="twitter:image"], meta[property="twitter:image"]"#;

/// Page-independent filters applied to every scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRules {
    denylist: Vec<String>,
    cdn: Option<Regex>,
}

impl ScanRules {
    /// An empty `cdn_pattern` disables the CDN tier; an invalid one is
    /// logged and disabled the same way.
    pub fn new(denylist: &[String], cdn_pattern: &str) -> Self {
        let denylist = denylist
            .iter()
            .map(|entry| entry.to_ascii_lowercase())
            .collect();
        let cdn = match cdn_pattern.trim() {
            "" => None,
            pattern => match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(target = "sorteio.finder", pattern, error = %err, "invalid CDN pattern; tier 0 disabled");
                    None
                }
            },
        };
        Self { denylist, cdn }
    }
}

#[derive(Clone)]
pub struct CandidateFinder {
    client: Client,
    rules: ScanRules,
}

impl CandidateFinder {
    pub fn new(client: Client, rules: ScanRules) -> Self {
        Self { client, rules }
    }

    pub async fn find_candidates(
        &self,
        page_url: &str,
        code: &str,
    ) -> Result<Vec<ImageCandidate>, FinderError> {
        let body = self.fetch_page(page_url).await?;
        discover_candidates(page_url, &body, code, &self.rules)
    }

    async fn fetch_page(&self, page_url: &str) -> Result<String, FinderError> {
        let fetch_error = |detail: String| FinderError::Fetch {
            url: page_url.to_string(),
            detail,
        };
        let response = self
            .client
            .get(page_url)
            .send()
            .await
            .map_err(|err| fetch_error(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {status}")));
        }
        response
            .text()
            .await
            .map_err(|err| fetch_error(err.to_string()))
    }
}

/// Runs the strategy chain over an already fetched page body.
pub fn discover_candidates(
    page_url: &str,
    html: &str,
    code: &str,
    rules: &ScanRules,
) -> Result<Vec<ImageCandidate>, FinderError> {
    let base = Url::parse(page_url).map_err(|err| FinderError::Fetch {
        url: page_url.to_string(),
        detail: format!("invalid page url: {err}"),
    })?;
    let doc = Html::parse_document(html);
    let ctx = PageContext {
        raw: html,
        doc: &doc,
        code_variants: code_variants(code),
        cdn: rules.cdn.as_ref(),
    };

    let mut accepted: Vec<ImageCandidate> = Vec::new();
    let mut seen = HashSet::new();
    let mut references = 0usize;
    let mut denied = 0usize;

    for strategy in STRATEGIES {
        if strategy.fallback_only && !accepted.is_empty() {
            continue;
        }
        let found = (strategy.run)(&ctx);
        debug!(
            target = "sorteio.finder",
            tier = strategy.method.tier(),
            found = found.len(),
            "strategy scanned"
        );
        for raw in found {
            references += 1;
            let Some(url) = normalize_url(&base, &raw) else {
                continue;
            };
            if is_denied(&url, &rules.denylist) {
                denied += 1;
                continue;
            }
            if seen.insert(url.clone()) {
                accepted.push(ImageCandidate {
                    url,
                    method: strategy.method,
                    order: accepted.len(),
                });
            }
        }
    }

    if accepted.is_empty() {
        return Err(FinderError::NoCandidates(format!(
            "no image matched product {code} ({references} references seen, {denied} denylisted)"
        )));
    }
    Ok(accepted)
}

fn cdn_pattern_urls(ctx: &PageContext<'_>) -> Vec<String> {
    let Some(re) = ctx.cdn else {
        return Vec::new();
    };
    // Script payloads embed URLs with JSON-escaped slashes.
    let unescaped = ctx.raw.replace("\\/", "/");
    re.find_iter(&unescaped)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn image_tag_urls(ctx: &PageContext<'_>) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(img) = selector("img") {
        for element in ctx.doc.select(&img) {
            let node = element.value();
            for attr in IMAGE_ATTRIBUTES {
                if let Some(value) = node.attr(attr) {
                    urls.push(value.to_string());
                }
            }
            for attr in SRCSET_ATTRIBUTES {
                if let Some(value) = node.attr(attr) {
                    urls.extend(srcset_urls(value));
                }
            }
        }
    }
    if let (Some(styled), Some(re)) = (selector("[style]"), BACKGROUND_URL.as_ref()) {
        for element in ctx.doc.select(&styled) {
            if let Some(style) = element.value().attr("style") {
                urls.extend(
                    re.captures_iter(style)
                        .filter_map(|caps| caps.get(1))
                        .map(|m| m.as_str().to_string()),
                );
            }
        }
    }
    urls.into_iter()
        .filter(|url| mentions_code(url, &ctx.code_variants))
        .collect()
}

fn preload_and_structured_urls(ctx: &PageContext<'_>) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(links) = selector("link[href]") {
        for element in ctx.doc.select(&links) {
            let node = element.value();
            let preload = node
                .attr("rel")
                .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("preload")));
            let as_image = node
                .attr("as")
                .is_some_and(|value| value.eq_ignore_ascii_case("image"));
            if preload && as_image && let Some(href) = node.attr("href") {
                urls.push(href.to_string());
            }
        }
    }
    if let Some(scripts) = selector(r#"script[type="application/ld+json"]"#) {
        for element in ctx.doc.select(&scripts) {
            let text: String = element.text().collect();
            if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
                collect_structured_images(&value, &mut urls);
            }
        }
    }
    urls
}

fn gallery_urls(ctx: &PageContext<'_>) -> Vec<String> {
    let Some(gallery) = selector(GALLERY_SELECTORS) else {
        return Vec::new();
    };
    ctx.doc
        .select(&gallery)
        .filter_map(|element| {
            let node = element.value();
            ["data-zoom", "data-src", "src"]
                .iter()
                .find_map(|attr| node.attr(attr))
                .map(str::to_string)
        })
        .collect()
}

fn meta_image_urls(ctx: &PageContext<'_>) -> Vec<String> {
    let Some(meta) = selector(META_IMAGE_SELECTORS) else {
        return Vec::new();
    };
    ctx.doc
        .select(&meta)
        .filter_map(|element| element.value().attr("content"))
        .map(str::to_string)
        .collect()
}

fn collect_structured_images(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_structured_images(item, out);
            }
        }
        Value::Object(map) => {
            for (key, inner) in map {
                if key == "image" {
                    collect_image_field(inner, out);
                } else if inner.is_object() || inner.is_array() {
                    collect_structured_images(inner, out);
                }
            }
        }
        _ => {}
    }
}

fn collect_image_field(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => out.push(url.clone()),
        Value::Array(items) => {
            for item in items {
                collect_image_field(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(url) = map
                .get("url")
                .or_else(|| map.get("contentUrl"))
                .and_then(Value::as_str)
            {
                out.push(url.to_string());
            }
        }
        _ => {}
    }
}

fn srcset_urls(srcset: &str) -> impl Iterator<Item = String> + '_ {
    srcset
        .split(',')
        .filter_map(|entry| entry.split_whitespace().next())
        .map(str::to_string)
}

fn mentions_code(url: &str, variants: &[String; 2]) -> bool {
    let lower = url.to_ascii_lowercase();
    variants.iter().any(|variant| lower.contains(variant.as_str()))
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Resolves a raw reference into an absolute http(s) URL.
pub fn normalize_url(base: &Url, raw: &str) -> Option<String> {
    let trimmed = raw.trim().replace("&amp;", "&");
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if ["data:", "javascript:", "blob:", "about:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }
    let resolved = base.join(&trimmed).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn is_denied(url: &str, denylist: &[String]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return true;
    };
    let haystack = format!(
        "{}{}",
        parsed.host_str().unwrap_or_default(),
        parsed.path()
    )
    .to_ascii_lowercase();
    denylist.iter().any(|entry| haystack.contains(entry.as_str()))
}
