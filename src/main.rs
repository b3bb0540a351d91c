mod bert_engine;
mod classical;
mod config;
mod error;
mod fetcher;
mod registry;
mod types;
mod vectorizer;

use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use metrics::counter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use error::ApiError;
use fetcher::ArtifactSource;
use registry::{ModelId, ModelRegistry};
use types::{HealthResponse, PredictRequest, PredictResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sentiment_server=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::info!("Starting sentiment server with config: {:?}", config);

    if config.skip_fetch {
        tracing::info!("Artifact fetch skipped by configuration");
    } else {
        match ArtifactSource::from_config(
            config.hub_repo.as_deref(),
            config.url_manifest.as_deref(),
        )? {
            Some(source) => fetcher::ensure_artifacts(&config.artifacts_dir, &source).await?,
            None => tracing::info!("No remote artifact source configured, serving local files"),
        }
    }

    if config.fetch_only {
        let missing = fetcher::missing_files(&config.artifacts_dir);
        if missing.is_empty() {
            tracing::info!("All required artifacts present");
        } else {
            tracing::warn!(missing = ?missing, "Some required artifacts are still missing");
        }
        return Ok(());
    }

    tracing::info!("Loading model registry...");
    let registry = ModelRegistry::load(&config.registry_options())?;
    tracing::info!("Models loaded: {:?}", registry.loaded_ids());

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = build_router(Arc::new(registry))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());

    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    registry: Arc<ModelRegistry>,
}

fn build_router(registry: Arc<ModelRegistry>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .with_state(AppState { registry })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.registry.health())
}

#[tracing::instrument(skip(state, request), fields(model = %request.model))]
async fn predict_handler(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    counter!("prediction_requests_total").increment(1);

    let model_name = request.model.to_lowercase();
    let id = ModelId::parse(&model_name)
        .filter(|id| state.registry.contains(*id))
        .ok_or_else(|| ApiError::UnknownModel {
            requested: model_name.clone(),
            loaded: state.registry.loaded_ids(),
        })?;

    // Inference is CPU-bound; keep it off the async workers.
    let texts = request.text.as_batch();
    let registry = Arc::clone(&state.registry);
    let prediction = tokio::task::spawn_blocking(move || registry.predict(id, &texts))
        .await
        .map_err(|e| anyhow::anyhow!("prediction task failed: {e}"))??;

    let confidence = prediction
        .confidences
        .as_ref()
        .map(|values| request.text.reshape(values.clone()));
    let confidence_text = prediction.confidences.map(|values| {
        request
            .text
            .reshape(values.into_iter().map(|value| format!("{value}%")).collect())
    });

    Ok(Json(PredictResponse {
        prediction: request.text.reshape(prediction.labels),
        text: request.text,
        model: model_name,
        confidence,
        confidence_text,
    }))
}
