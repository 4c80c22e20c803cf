//! Metric Corrections - OCR metric normalization and conversational correction service.

mod config;
mod corrections;
mod error;
mod intent;
mod mentions;
mod merge;
mod normalizer;
mod pipeline;
mod rules;
mod schema;
mod session;
mod store;
mod supabase;
mod training;
mod values;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use config::{MetricDefinition, MetricVocabulary, Settings};
use pipeline::{IngestOutcome, MessageOutcome, MetricPipeline};
use schema::{DailyMetricRecord, RecordKey};
use std::sync::Arc;
use store::{
    MemoryRecordStore, MemoryTrainingSink, MetricCatalog, RecordStore, TrainingSink,
    VocabularyCatalog,
};
use supabase::SupabaseClient;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<MetricPipeline>,
    vocabulary: Arc<MetricVocabulary>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "metric_corrections=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let vocabulary = Arc::new(settings.load_vocabulary()?);
    info!("Metric vocabulary ready: {} metrics", vocabulary.len());

    // Pick the storage backend
    let (catalog, store, sink) = match &settings.supabase {
        Some(supabase) => {
            let client = Arc::new(SupabaseClient::new(supabase, vocabulary.clone()));
            info!("Supabase storage at {} (schema {})", supabase.url, supabase.schema);
            (
                client.clone() as Arc<dyn MetricCatalog>,
                client.clone() as Arc<dyn RecordStore>,
                client as Arc<dyn TrainingSink>,
            )
        }
        None => {
            info!("Supabase not configured, using in-memory storage");
            (
                Arc::new(VocabularyCatalog::new(vocabulary.clone())) as Arc<dyn MetricCatalog>,
                Arc::new(MemoryRecordStore::new()) as Arc<dyn RecordStore>,
                Arc::new(MemoryTrainingSink::new()) as Arc<dyn TrainingSink>,
            )
        }
    };

    let state = AppState {
        pipeline: Arc::new(MetricPipeline::new(vocabulary.clone(), catalog, store, sink)),
        vocabulary,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/vocabulary", get(list_vocabulary))
        .route("/ocr", post(ingest_ocr))
        .route("/messages", post(handle_message))
        .route("/records/:user_id/:metric_date", get(get_record))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// List the metric vocabulary.
async fn list_vocabulary(State(state): State<AppState>) -> Json<Vec<MetricDefinition>> {
    Json(state.vocabulary.iter().cloned().collect())
}

#[derive(serde::Deserialize)]
struct OcrRequest {
    user_id: String,
    metric_date: NaiveDate,
    session_id: Option<String>,
    payload: serde_json::Value,
}

/// Normalize an OCR payload and merge it into the day record.
async fn ingest_ocr(
    State(state): State<AppState>,
    Json(req): Json<OcrRequest>,
) -> Result<Json<IngestOutcome>, (StatusCode, String)> {
    let key = RecordKey::new(req.user_id, req.metric_date);
    state
        .pipeline
        .ingest_ocr(&key, req.session_id.as_deref(), &req.payload)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("Failed to store metrics: {}", e)))
}

#[derive(serde::Deserialize)]
struct MessageRequest {
    user_id: String,
    metric_date: NaiveDate,
    session_id: String,
    text: String,
}

/// Run a chat message through correction detection.
///
/// Storage failures degrade to "nothing captured" so the conversation keeps going.
async fn handle_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Json<MessageOutcome> {
    let key = RecordKey::new(req.user_id, req.metric_date);
    match state.pipeline.handle_message(&key, &req.session_id, &req.text).await {
        Ok(outcome) => Json(outcome),
        Err(e) => {
            error!("Message handling failed for {}: {}", key, e);
            Json(MessageOutcome::default())
        }
    }
}

/// Get the stored record for a user and day.
async fn get_record(
    State(state): State<AppState>,
    Path((user_id, metric_date)): Path<(String, NaiveDate)>,
) -> Result<Json<DailyMetricRecord>, (StatusCode, String)> {
    let key = RecordKey::new(user_id, metric_date);
    match state.pipeline.record(&key).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("No record for {}", key))),
        Err(e) => {
            error!("Failed to read record {}: {}", key, e);
            Err((StatusCode::BAD_GATEWAY, format!("Failed to read record: {}", e)))
        }
    }
}
