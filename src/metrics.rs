use tracing::trace;

// Metrics are plain trace events under one target; a log pipeline can count
// them without a metrics exporter in the process.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "sorteio.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "sorteio.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn candidate_scored(tier: u8, white_ratio: f64, score: Option<u32>) {
    trace!(
        target = "sorteio.metrics",
        tier = tier,
        white_ratio = white_ratio,
        score = score.unwrap_or(0),
        passed = score.is_some(),
        "candidate_scored"
    );
}
