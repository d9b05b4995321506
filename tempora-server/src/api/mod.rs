//! HTTP API endpoints

use crate::protocol::{forward, line};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempora_core::ingest::{IngestStats, IngestStatsSnapshot, QueueGauge};
use tempora_core::query::{
    render_time, Engine, FieldGrouper, GroupTree, GroupedTable, Grouper, QueryRequest, TimeGrouper,
};
use tempora_core::rollup::{RollupStats, RollupStatsSnapshot};
use tempora_core::tier::parse_duration;
use tempora_core::{AggregateFunction, Metric, TemporaError, Timestamp, NANOS_PER_SEC};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared handler state
pub struct ServerState {
    pub engine: Engine,
    /// Source feeding the ingestion pipeline
    pub writes: Sender<Metric>,
    pub ingest_stats: Arc<IngestStats>,
    pub queue: Option<QueueGauge>,
    pub rollup_stats: Arc<RollupStats>,
}

/// Application state
pub type AppState = Arc<ServerState>;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/write", post(write))
        .route("/query", get(query))
        .route("/metrics/index.json", get(metric_index))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    precision: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IndexParams {
    jsonp: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct FlatResponse {
    pub results: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct GroupedResponse {
    pub aggregate: &'static str,
    #[serde(flatten)]
    pub table: GroupedTable,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub ingest: IngestStatsSnapshot,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub rollup: RollupStatsSnapshot,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

impl From<TemporaError> for ErrorResponse {
    fn from(e: TemporaError) -> Self {
        Self {
            error: e.to_string(),
        }
    }
}

fn from_core(e: TemporaError) -> ApiError {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(e.into()))
}

/// A parsed `/query` request
#[derive(Debug)]
pub struct QuerySpec {
    pub request: QueryRequest,
    pub group_by: Vec<String>,
    pub render: Vec<String>,
    pub aggregate: AggregateFunction,
}

impl QuerySpec {
    /// Parse repeated query-string pairs; `now` is in nanoseconds
    pub fn from_pairs(pairs: &[(String, String)], now: Timestamp) -> Result<Self, TemporaError> {
        let mut shard_key = None;
        let mut start = now - 3600 * NANOS_PER_SEC;
        let mut end = now;
        let mut filter = BTreeMap::new();
        let mut group_by = Vec::new();
        let mut render = Vec::new();
        let mut aggregate = AggregateFunction::Sum;

        for (name, value) in pairs {
            match name.as_str() {
                "shardKey" => shard_key = Some(value.clone()).filter(|v| !v.is_empty()),
                "startDate" => start = parse_time(value)?,
                "endDate" => end = parse_time(value)?,
                "filter" => {
                    let parts: Vec<&str> = value.split(':').collect();
                    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
                        return Err(TemporaError::QueryInput(format!(
                            "invalid filter specified: {}",
                            value
                        )));
                    }
                    if filter
                        .insert(parts[0].to_string(), parts[1].to_string())
                        .is_some()
                    {
                        return Err(TemporaError::QueryInput(format!(
                            "cannot use same filter key more than once: {}",
                            parts[0]
                        )));
                    }
                }
                "groupBy" => group_by.push(value.clone()),
                "render" => render.push(value.clone()),
                "aggregate" => {
                    aggregate = AggregateFunction::from_name(value).ok_or_else(|| {
                        TemporaError::QueryInput(format!("unknown aggregate: {}", value))
                    })?
                }
                _ => {}
            }
        }

        let shard_key = shard_key
            .ok_or_else(|| TemporaError::QueryInput("no shardKey specified".into()))?;
        let mut request = QueryRequest::new(shard_key, start, end);
        request.filter = filter;
        request.validate()?;

        Ok(Self {
            request,
            group_by,
            render,
            aggregate,
        })
    }

    /// Groupers for the requested `groupBy` fields; `time:<duration>` splits by window
    pub fn groupers(&self) -> Result<Vec<Box<dyn Grouper>>, TemporaError> {
        self.group_by
            .iter()
            .map(|field| -> Result<Box<dyn Grouper>, TemporaError> {
                match field.strip_prefix("time:") {
                    Some(window) => {
                        let window = parse_duration(window).map_err(|e| {
                            TemporaError::QueryInput(format!("invalid groupBy window: {}", e))
                        })?;
                        Ok(Box::new(TimeGrouper::new(window)))
                    }
                    None => Ok(Box::new(FieldGrouper::new(field.clone()))),
                }
            })
            .collect()
    }
}

/// RFC 3339 or integer unix seconds, as nanoseconds
fn parse_time(raw: &str) -> Result<Timestamp, TemporaError> {
    if let Ok(time) = chrono::DateTime::parse_from_rfc3339(raw) {
        return time
            .timestamp_nanos_opt()
            .ok_or_else(|| TemporaError::QueryInput(format!("date out of range: {}", raw)));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| secs.checked_mul(NANOS_PER_SEC))
        .ok_or_else(|| TemporaError::QueryInput(format!("could not parse date: {}", raw)))
}

fn now_nanos() -> Timestamp {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: tempora_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn write(
    State(state): State<AppState>,
    Query(params): Query<WriteParams>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let precision = params.precision.unwrap_or_default();
    let decoded = line::parse_body(&body, &precision, now_nanos()).map_err(from_core)?;

    for (line, error) in &decoded.errors {
        warn!(line, error = %error, "Rejected point");
    }
    if decoded.metrics.is_empty() {
        if let Some((line, error)) = decoded.errors.into_iter().next() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("line {}: {}", line, error),
            ));
        }
        return Ok(StatusCode::NO_CONTENT);
    }

    forward(&state.writes, decoded.metrics)
        .await
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn query(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let spec = QuerySpec::from_pairs(&pairs, now_nanos()).map_err(from_core)?;
    let groupers = spec.groupers().map_err(from_core)?;

    // bucket reads are synchronous store calls
    tokio::task::spawn_blocking(move || run_query(&state, &spec, &groupers))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
}

fn run_query(
    state: &ServerState,
    spec: &QuerySpec,
    groupers: &[Box<dyn Grouper>],
) -> Result<Response, ApiError> {
    if groupers.is_empty() {
        let results = state
            .engine
            .query(&spec.request)
            .map_err(from_core)?
            .into_iter()
            .map(|point| {
                let mut row = point.metadata;
                row.insert("_date".to_string(), render_time(point.timestamp));
                row.insert("_value".to_string(), point.value.to_string());
                row
            })
            .collect();
        return Ok(Json(FlatResponse { results }).into_response());
    }

    let groups = state.engine.query_groups(&spec.request).map_err(from_core)?;
    let table = GroupTree::build(groups, groupers).build_result_set(&spec.render, spec.aggregate);
    Ok(Json(GroupedResponse {
        aggregate: spec.aggregate.name(),
        table,
    })
    .into_response())
}

async fn metric_index(
    State(state): State<AppState>,
    Query(params): Query<IndexParams>,
) -> Result<Response, ApiError> {
    let names = state.engine.metric_names().map_err(from_core)?;
    let json = serde_json::to_string(&names)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match params.jsonp.filter(|cb| !cb.is_empty()) {
        Some(callback) => {
            let valid = callback
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'));
            if !valid {
                return Err(api_error(StatusCode::BAD_REQUEST, "invalid jsonp callback"));
            }
            Ok((
                [(header::CONTENT_TYPE, "application/javascript")],
                format!("{}({})", callback, json),
            )
                .into_response())
        }
        None => Ok(([(header::CONTENT_TYPE, "application/json")], json).into_response()),
    }
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(collect_stats(&state))
}

fn collect_stats(state: &ServerState) -> StatsResponse {
    StatsResponse {
        ingest: state.ingest_stats.snapshot(),
        queue_depth: state.queue.as_ref().map_or(0, |q| q.depth()),
        queue_capacity: state.queue.as_ref().map_or(0, |q| q.capacity()),
        rollup: state.rollup_stats.snapshot(),
    }
}

async fn metrics(State(state): State<AppState>) -> String {
    let stats = collect_stats(&state);

    // Prometheus format
    let mut output = String::new();
    let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
        output.push_str(&format!("# HELP tempora_{} {}\n", name, help));
        output.push_str(&format!("# TYPE tempora_{} {}\n", name, kind));
        output.push_str(&format!("tempora_{} {}\n", name, value));
    };

    let ingest = stats.ingest;
    metric("samples_received_total", "counter", "Samples taken off the ingestion queue", ingest.received);
    metric("samples_persisted_total", "counter", "Samples written to the store", ingest.persisted);
    metric("samples_unroutable_total", "counter", "Samples matching no tier set", ingest.unroutable);
    metric("samples_discarded_total", "counter", "Samples dropped by load shedding", ingest.discarded);
    metric("store_errors_total", "counter", "Failed store batches", ingest.store_errors);
    metric("flushes_total", "counter", "Worker batch flushes", ingest.flushes);
    metric("queue_depth", "gauge", "Samples waiting in the ingestion queue", stats.queue_depth as u64);
    metric("queue_capacity", "gauge", "Capacity of the ingestion queue", stats.queue_capacity as u64);

    let rollup = stats.rollup;
    metric("rollup_ticks_total", "counter", "Rollup scheduler ticks", rollup.ticks);
    metric("rollup_buckets_total", "counter", "Buckets migrated to the next tier", rollup.buckets_rolled);
    metric("rollup_terminal_total", "counter", "Markers removed without migration", rollup.buckets_terminal);
    metric("rollup_errors_total", "counter", "Rollup failures", rollup.errors);

    output
}
