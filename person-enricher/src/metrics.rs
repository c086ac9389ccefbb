use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

pub const MESSAGES_FETCHED: &str = "person_enricher_messages_fetched_total";
pub const MESSAGES_INVALID: &str = "person_enricher_messages_invalid_total";
pub const MESSAGES_DEAD_LETTERED: &str = "person_enricher_messages_dead_lettered_total";
pub const MESSAGES_COMMITTED: &str = "person_enricher_messages_committed_total";
pub const PERSONS_CREATED: &str = "person_enricher_persons_created_total";
pub const ENRICHMENT_FAILURES: &str = "person_enricher_enrichment_failures_total";
pub const ENRICHMENT_RETRIES: &str = "person_enricher_enrichment_retries_total";
pub const ENRICHMENT_DURATION: &str = "person_enricher_enrichment_duration_seconds";
pub const LOOKUP_REQUESTS: &str = "person_enricher_lookup_requests_total";
pub const CACHE_LOOKUPS: &str = "person_enricher_cache_lookups_total";
pub const CACHE_ERRORS: &str = "person_enricher_cache_errors_total";
pub const KAFKA_COMMIT_ERRORS: &str = "person_enricher_kafka_commit_errors_total";
pub const REPEATED_COMPLETIONS: &str = "person_enricher_repeated_completions_total";
pub const QUEUE_DEPTH: &str = "person_enricher_queue_depth";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Operational endpoints: liveness from the stage registry, a static
/// readiness check, and the Prometheus scrape.
pub fn setup_router(liveness: HealthRegistry, recorder_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "person enricher"
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
