use crate::candidates::{CandidateFinder, FinderError, ImageCandidate, ScanRules};
use crate::compositor::Compositor;
use crate::config::{Branding, PipelineSettings};
use crate::evaluator::{CandidateEvaluator, EvaluatedCandidate};
use crate::http::{build_browser_client, build_client};
use crate::models::{FailureInfo, Outcome, ProcessRequest, ProcessingResult, StageReport};
use crate::product_code::{CodeError, CodeExtractor};
use crate::publisher::Publisher;
use image::DynamicImage;
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Clone)]
pub struct Pipeline {
    pub settings: Arc<PipelineSettings>,
    extractor: Arc<CodeExtractor>,
    finder: CandidateFinder,
    evaluator: CandidateEvaluator,
    compositor: Compositor,
    publisher: Publisher,
}

/// The square artifact path, which must succeed for the run to count.
struct PrimaryArtifact {
    code: String,
    image: Arc<DynamicImage>,
    url: Option<String>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, branding: &Branding) -> Result<Self, CodeError> {
        let extractor = CodeExtractor::new(&settings.code_prefixes)?;
        let page_client = build_browser_client(settings.page_timeout, settings.connect_timeout);
        let image_client = build_browser_client(settings.image_timeout, settings.connect_timeout);
        let upload_client = build_client(settings.image_timeout * 3, settings.connect_timeout);
        let compositor = Compositor::new(branding);
        if !compositor.has_captions() {
            warn!(target = "sorteio.pipeline", "no usable caption font; square artifacts carry no text");
        }
        Ok(Self {
            extractor: Arc::new(extractor),
            finder: CandidateFinder::new(
                page_client,
                ScanRules::new(&settings.denylist, &settings.cdn_pattern),
            ),
            evaluator: CandidateEvaluator::new(image_client, settings.image_max_bytes),
            compositor,
            publisher: Publisher::new(
                upload_client,
                settings.upload_endpoint.clone(),
                settings.upload_url_prefix.clone(),
            ),
            settings: Arc::new(settings),
        })
    }

    /// Runs one product page through extraction, selection, composition and
    /// publishing. Never errors: failures are reported inside the result.
    pub async fn process_product(&self, request: ProcessRequest) -> ProcessingResult {
        let vertical = request.vertical.unwrap_or(self.settings.vertical_enabled);
        let dry_run = request.dry_run.unwrap_or(self.settings.dry_run);
        let started = Instant::now();
        info!(target = "sorteio.pipeline", page_url = %request.page_url, vertical, dry_run, "processing product");

        let mut stages = Vec::new();
        let primary = match self
            .run_primary(&request.page_url, dry_run, &mut stages)
            .await
        {
            Ok(primary) => primary,
            Err(err) => {
                warn!(
                    target = "sorteio.pipeline",
                    page_url = %request.page_url,
                    stage = err.stage(),
                    kind = err.kind().as_str(),
                    detail = err.detail(),
                    "product failed"
                );
                return ProcessingResult {
                    product_code: None,
                    primary_url: None,
                    secondary_url: None,
                    message: err.to_string(),
                    outcome: Outcome::Failed,
                    failure: Some(err.info()),
                    stages,
                };
            }
        };

        let mut result = ProcessingResult {
            product_code: Some(primary.code.clone()),
            primary_url: primary.url.clone(),
            secondary_url: None,
            message: String::new(),
            outcome: Outcome::Success,
            failure: None,
            stages: Vec::new(),
        };

        if vertical {
            match self
                .run_vertical(&primary, dry_run, &mut stages)
                .await
            {
                Ok(url) => result.secondary_url = url,
                Err(err) => {
                    warn!(
                        target = "sorteio.pipeline",
                        code = %primary.code,
                        stage = err.stage(),
                        detail = err.detail(),
                        "vertical artifact failed; keeping square"
                    );
                    result.outcome = Outcome::Partial;
                    result.message = format!("square artifact ready; {err}");
                    result.failure = Some(err.info());
                }
            }
        }

        if result.outcome == Outcome::Success {
            result.message = match (dry_run, vertical) {
                (true, _) => "dry run: artifacts composed, publishing skipped".to_string(),
                (false, true) => "square and vertical artifacts published".to_string(),
                (false, false) => "square artifact published".to_string(),
            };
        }
        result.stages = stages;

        info!(
            target = "sorteio.pipeline",
            code = %primary.code,
            outcome = ?result.outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "product processed"
        );
        result
    }

    async fn run_primary(
        &self,
        page_url: &str,
        dry_run: bool,
        stages: &mut Vec<StageReport>,
    ) -> Result<PrimaryArtifact, PipelineError> {
        let code = self
            .capture_stage(
                "extract_code",
                stages,
                stages::extract_code(&self.extractor, page_url),
            )
            .await?;

        let candidates = self
            .capture_stage(
                "find_candidates",
                stages,
                stages::find_candidates(&self.finder, page_url, &code),
            )
            .await?;

        let selected = self
            .capture_stage(
                "select_image",
                stages,
                stages::select_image(&self.evaluator, &candidates),
            )
            .await?;
        let image = Arc::new(selected.image);

        let square = self
            .capture_stage(
                "compose_square",
                stages,
                stages::compose(
                    "compose_square",
                    self.compositor.clone(),
                    image.clone(),
                    Artifact::Square,
                ),
            )
            .await?;

        let url = if dry_run {
            None
        } else {
            Some(
                self.capture_stage(
                    "publish_square",
                    stages,
                    stages::publish(
                        "publish_square",
                        &self.publisher,
                        square,
                        format!("{code}-square.png"),
                    ),
                )
                .await?,
            )
        };

        Ok(PrimaryArtifact { code, image, url })
    }

    async fn run_vertical(
        &self,
        primary: &PrimaryArtifact,
        dry_run: bool,
        stages: &mut Vec<StageReport>,
    ) -> Result<Option<String>, PipelineError> {
        let bytes = self
            .capture_stage(
                "compose_vertical",
                stages,
                stages::compose(
                    "compose_vertical",
                    self.compositor.clone(),
                    primary.image.clone(),
                    Artifact::Vertical,
                ),
            )
            .await?;
        if dry_run {
            return Ok(None);
        }
        let url = self
            .capture_stage(
                "publish_vertical",
                stages,
                stages::publish(
                    "publish_vertical",
                    &self.publisher,
                    bytes,
                    format!("{}-vertical.png", primary.code),
                ),
            )
            .await?;
        Ok(Some(url))
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        match outcome {
            Ok(outcome) => {
                stages.push(StageReport::new(name, elapsed_ms, outcome.output));
                Ok(outcome.value)
            }
            Err(err) => {
                stages.push(StageReport::new(
                    name,
                    elapsed_ms,
                    json!({ "error": err.kind().as_str(), "detail": err.detail() }),
                ));
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Artifact {
    Square,
    Vertical,
}

mod stages {
    use super::*;

    pub(super) async fn extract_code(
        extractor: &CodeExtractor,
        page_url: &str,
    ) -> Result<StageOutcome<String>, PipelineError> {
        let code = extractor.extract(page_url).map_err(|err| {
            PipelineError::new("extract_code", FailureKind::CodeNotFound, err.to_string())
        })?;
        let output = json!({ "product_code": code });
        Ok(StageOutcome::new(code, output))
    }

    pub(super) async fn find_candidates(
        finder: &CandidateFinder,
        page_url: &str,
        code: &str,
    ) -> Result<StageOutcome<Vec<ImageCandidate>>, PipelineError> {
        let candidates = finder
            .find_candidates(page_url, code)
            .await
            .map_err(|err| {
                let kind = match err {
                    FinderError::Fetch { .. } => FailureKind::FetchError,
                    FinderError::NoCandidates(_) => FailureKind::NoCandidatesFound,
                };
                PipelineError::new("find_candidates", kind, err.to_string())
            })?;
        let mut by_tier = BTreeMap::new();
        for candidate in &candidates {
            *by_tier
                .entry(candidate.method.tier().to_string())
                .or_insert(0usize) += 1;
        }
        let output = json!({
            "count": candidates.len(),
            "by_tier": by_tier,
            "preview": candidates.iter().take(3).map(|c| c.url.as_str()).collect::<Vec<_>>(),
        });
        Ok(StageOutcome::new(candidates, output))
    }

    pub(super) async fn select_image(
        evaluator: &CandidateEvaluator,
        candidates: &[ImageCandidate],
    ) -> Result<StageOutcome<EvaluatedCandidate>, PipelineError> {
        let best = evaluator.select_best(candidates).await.map_err(|err| {
            PipelineError::new("select_image", FailureKind::NoSuitableImage, err.to_string())
        })?;
        let output = json!({
            "url": best.candidate.url,
            "tier": best.candidate.method.tier(),
            "white_ratio": best.white_ratio,
            "width": best.width,
            "height": best.height,
            "score": best.score,
            "evaluated": candidates.len(),
        });
        Ok(StageOutcome::new(best, output))
    }

    pub(super) async fn compose(
        stage: &'static str,
        compositor: Compositor,
        image: Arc<DynamicImage>,
        artifact: Artifact,
    ) -> Result<StageOutcome<Vec<u8>>, PipelineError> {
        let composition_error =
            |detail: String| PipelineError::new(stage, FailureKind::CompositionError, detail);
        let has_captions = compositor.has_captions();
        let bytes = tokio::task::spawn_blocking(move || match artifact {
            Artifact::Square => compositor.compose_square(&image),
            Artifact::Vertical => compositor.compose_vertical(&image),
        })
        .await
        .map_err(|err| composition_error(err.to_string()))?
        .map_err(|err| composition_error(err.to_string()))?;
        let output = match artifact {
            Artifact::Square => json!({
                "bytes": bytes.len(),
                "width": crate::compositor::square::SQUARE_SIZE,
                "height": crate::compositor::square::SQUARE_SIZE,
                "captions": has_captions,
            }),
            Artifact::Vertical => json!({
                "bytes": bytes.len(),
                "width": crate::compositor::vertical::VERTICAL_WIDTH,
                "height": crate::compositor::vertical::VERTICAL_HEIGHT,
            }),
        };
        Ok(StageOutcome::new(bytes, output))
    }

    pub(super) async fn publish(
        stage: &'static str,
        publisher: &Publisher,
        bytes: Vec<u8>,
        filename: String,
    ) -> Result<StageOutcome<String>, PipelineError> {
        let url = publisher
            .publish(bytes, &filename)
            .await
            .map_err(|err| PipelineError::new(stage, FailureKind::UploadError, err.to_string()))?;
        let output = json!({ "url": url, "filename": filename });
        Ok(StageOutcome::new(url, output))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CodeNotFound,
    FetchError,
    NoCandidatesFound,
    NoSuitableImage,
    CompositionError,
    UploadError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::CodeNotFound => "code_not_found",
            FailureKind::FetchError => "fetch_error",
            FailureKind::NoCandidatesFound => "no_candidates_found",
            FailureKind::NoSuitableImage => "no_suitable_image",
            FailureKind::CompositionError => "composition_error",
            FailureKind::UploadError => "upload_error",
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: FailureKind,
}

impl PipelineError {
    pub fn new(stage: &'static str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    fn info(&self) -> FailureInfo {
        FailureInfo {
            stage: self.stage.to_string(),
            kind: self.kind.as_str().to_string(),
            detail: self.message.clone(),
        }
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::encode_png;
    use image::{Rgb, RgbImage};
    use wiremock::matchers::{method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    const HOSTED: &str = "https://files.catbox.moe/";

    /// Matches multipart uploads by the filename they carry.
    struct UploadNamed(&'static str);

    impl Match for UploadNamed {
        fn matches(&self, request: &Request) -> bool {
            let needle = self.0.as_bytes();
            request.body.windows(needle.len()).any(|w| w == needle)
        }
    }

    fn pipeline(server: &MockServer, vertical: bool) -> Pipeline {
        let settings = PipelineSettings {
            upload_endpoint: format!("{}/user/api.php", server.uri()),
            upload_url_prefix: HOSTED.to_string(),
            vertical_enabled: vertical,
            ..PipelineSettings::default()
        };
        Pipeline::new(settings, &Branding::default()).expect("pipeline")
    }

    fn product_png() -> Vec<u8> {
        let mut img = RgbImage::from_pixel(1000, 1000, Rgb([255, 255, 255]));
        for y in 300..700 {
            for x in 350..650 {
                img.put_pixel(x, y, Rgb([30, 60, 180]));
            }
        }
        encode_png(img).expect("png")
    }

    async fn mount_product_page(server: &MockServer) -> String {
        let html = r#"<html><body>
            <img src="/static/logo.png">
            <img src="/images/NATBRA-123456789-front.png" alt="produto">
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/p/kumbh-desodorante/NATBRA-123456789"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/images/NATBRA-123456789-front.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(product_png()),
            )
            .mount(server)
            .await;
        format!("{}/p/kumbh-desodorante/NATBRA-123456789", server.uri())
    }

    fn stage_names(result: &ProcessingResult) -> Vec<&str> {
        result.stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn url_without_code_fails_before_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let page = format!("{}/produto/fone-bluetooth", server.uri());
        let result = pipeline(&server, false)
            .process_product(ProcessRequest::new(page))
            .await;
        assert_eq!(result.outcome, Outcome::Failed);
        let failure = result.failure.expect("failure");
        assert_eq!(failure.kind, "code_not_found");
        assert_eq!(failure.stage, "extract_code");
        assert!(result.primary_url.is_none());
    }

    #[tokio::test]
    async fn missing_page_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let page = format!("{}/p/colonia/NATBRA-42", server.uri());
        let result = pipeline(&server, false)
            .process_product(ProcessRequest::new(page))
            .await;
        assert_eq!(stage_names(&result), vec!["extract_code", "find_candidates"]);
        let failure = result.failure.as_ref().expect("failure");
        assert_eq!(failure.kind, "fetch_error");
        assert_eq!(failure.stage, "find_candidates");
        assert!(failure.detail.contains("404"), "{}", failure.detail);
    }

    #[tokio::test]
    async fn page_without_matching_images_has_no_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body><img src=\"/static/logo.png\"><p>oi</p></body></html>"),
            )
            .mount(&server)
            .await;

        let page = format!("{}/p/colonia/NATBRA-42", server.uri());
        let result = pipeline(&server, false)
            .process_product(ProcessRequest::new(page))
            .await;
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.failure.expect("failure").kind, "no_candidates_found");
    }

    #[tokio::test]
    async fn white_border_candidate_is_scored_and_published() {
        let server = MockServer::start().await;
        let page = mount_product_page(&server).await;
        Mock::given(method("POST"))
            .and(path("/user/api.php"))
            .and(UploadNamed("NATBRA-123456789-square.png"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://files.catbox.moe/sq1.png"))
            .expect(1)
            .mount(&server)
            .await;

        let result = pipeline(&server, false)
            .process_product(ProcessRequest::new(page))
            .await;
        assert_eq!(result.outcome, Outcome::Success, "{}", result.message);
        assert_eq!(result.product_code.as_deref(), Some("NATBRA-123456789"));
        assert_eq!(result.primary_url.as_deref(), Some("https://files.catbox.moe/sq1.png"));
        assert!(result.secondary_url.is_none());

        let selected = result
            .stages
            .iter()
            .find(|s| s.name == "select_image")
            .expect("select stage");
        assert_eq!(selected.output["score"], json!(1700));
        assert_eq!(
            stage_names(&result),
            vec![
                "extract_code",
                "find_candidates",
                "select_image",
                "compose_square",
                "publish_square"
            ]
        );
    }

    #[tokio::test]
    async fn vertical_upload_failure_is_partial() {
        let server = MockServer::start().await;
        let page = mount_product_page(&server).await;
        Mock::given(method("POST"))
            .and(UploadNamed("-square.png"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://files.catbox.moe/sq1.png"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(UploadNamed("-vertical.png"))
            .respond_with(ResponseTemplate::new(500).set_body_string("busy"))
            .mount(&server)
            .await;

        let result = pipeline(&server, true)
            .process_product(ProcessRequest::new(page))
            .await;
        assert_eq!(result.outcome, Outcome::Partial);
        assert_eq!(result.primary_url.as_deref(), Some("https://files.catbox.moe/sq1.png"));
        assert!(result.secondary_url.is_none());
        let failure = result.failure.expect("failure");
        assert_eq!(failure.stage, "publish_vertical");
        assert_eq!(failure.kind, "upload_error");
    }

    #[tokio::test]
    async fn vertical_artifact_is_published_alongside_square() {
        let server = MockServer::start().await;
        let page = mount_product_page(&server).await;
        Mock::given(method("POST"))
            .and(UploadNamed("-square.png"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://files.catbox.moe/sq1.png"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(UploadNamed("-vertical.png"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://files.catbox.moe/vt1.png"))
            .mount(&server)
            .await;

        let result = pipeline(&server, true)
            .process_product(ProcessRequest::new(page))
            .await;
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.secondary_url.as_deref(), Some("https://files.catbox.moe/vt1.png"));
        assert_eq!(result.stages.len(), 7);
    }

    #[tokio::test]
    async fn dry_run_composes_without_uploading() {
        let server = MockServer::start().await;
        let page = mount_product_page(&server).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let request = ProcessRequest {
            dry_run: Some(true),
            vertical: Some(true),
            ..ProcessRequest::new(page)
        };
        let result = pipeline(&server, false).process_product(request).await;
        assert_eq!(result.outcome, Outcome::Success);
        assert!(result.primary_url.is_none());
        assert!(result.message.contains("dry run"));
        assert_eq!(
            stage_names(&result),
            vec![
                "extract_code",
                "find_candidates",
                "select_image",
                "compose_square",
                "compose_vertical"
            ]
        );
    }

    #[test]
    fn failure_kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(FailureKind::NoCandidatesFound).unwrap(),
            json!("no_candidates_found")
        );
        let err = PipelineError::new("publish_square", FailureKind::UploadError, "HTTP 500");
        assert_eq!(err.to_string(), "stage `publish_square` failed: HTTP 500");
    }
}
