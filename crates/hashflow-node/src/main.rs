//! Hashflow node binary: an HTTP API over the batch hashtag aggregator.
//!
//! Wires the sled stores, the local change feed, and an optional interval scheduler
//! around one shared [`Aggregator`]. Runs are triggered on demand with `POST /jobs/run`
//! or by the scheduler; each run executes on the blocking thread pool.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Extension, Path, Query, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hashflow_core::{JobId, JobRecord, NewRecord, Record, WindowCounter, WindowKey, JOB_KIND_HASHTAGS};
use hashflow_engine::{
    Aggregator, AggregatorConfig, ChangeEvent, ChangeKind, Clock, CounterStore, HashflowError,
    JobOutcome, JobStore, RecordStore, SystemClock, DEFAULT_BATCH_LIMIT,
};
use hashflow_storage_sled::{SledConfig, SledStore};
use hashflow_stream_local::{FeedHandle, LocalChangeFeed};
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

type HashtagAggregator =
    Aggregator<SledStore, SledStore, SledStore, Arc<LocalChangeFeed>, SystemClock>;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NodeConfig {
    listen: Option<String>,
    data_dir: PathBuf,
    job: JobConfig,
    storage: StorageConfig,
    health: HealthConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: Some("127.0.0.1:8080".into()),
            data_dir: PathBuf::from("./data"),
            job: JobConfig::default(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct JobConfig {
    batch_limit: usize,
    /// Humantime string, e.g. `"30s"`.
    deadline: Option<String>,
    /// Humantime string; the scheduler only runs when set.
    schedule_interval: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            deadline: None,
            schedule_interval: None,
        }
    }
}

impl JobConfig {
    fn deadline(&self) -> anyhow::Result<Option<Duration>> {
        parse_duration_opt(self.deadline.as_deref()).context("invalid node.job.deadline")
    }

    fn schedule_interval(&self) -> anyhow::Result<Option<Duration>> {
        let interval = parse_duration_opt(self.schedule_interval.as_deref())
            .context("invalid node.job.schedule_interval")?;
        if interval.is_some_and(|d| d.is_zero()) {
            anyhow::bail!("node.job.schedule_interval must be greater than zero");
        }
        Ok(interval)
    }

    fn to_aggregator_config(&self) -> anyhow::Result<AggregatorConfig> {
        if self.batch_limit == 0 {
            anyhow::bail!("node.job.batch_limit must be at least 1");
        }
        Ok(AggregatorConfig {
            batch_limit: self.batch_limit,
            deadline: self.deadline()?,
            job_kind: JOB_KIND_HASHTAGS.to_string(),
        })
    }
}

fn parse_duration_opt(raw: Option<&str>) -> anyhow::Result<Option<Duration>> {
    raw.map(|s| humantime::parse_duration(s.trim()).map_err(anyhow::Error::from))
        .transpose()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct StorageConfig {
    flush_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_on_write: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HealthConfig {
    /// Mark degraded when disk usage exceeds this fraction (0.0-1.0).
    #[serde(default = "HealthConfig::default_disk_threshold")]
    disk_usage_degraded: f32,
}

impl HealthConfig {
    const fn default_disk_threshold() -> f32 {
        0.9
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disk_usage_degraded: Self::default_disk_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigWrapper {
    #[serde(default)]
    node: NodeConfig,
}

#[derive(Clone)]
struct AppState {
    aggregator: Arc<HashtagAggregator>,
    store: SledStore,
    feed: Arc<LocalChangeFeed>,
    data_dir: PathBuf,
    health: HealthConfig,
    #[cfg(feature = "metrics")]
    metrics_handle: PrometheusHandle,
}

impl AppState {
    fn open(cfg: &NodeConfig) -> anyhow::Result<Self> {
        let mut sled_cfg = SledConfig::new(cfg.data_dir.clone());
        sled_cfg.flush_on_write = cfg.storage.flush_on_write;
        let store = SledStore::open(sled_cfg)
            .with_context(|| format!("opening store at {}", cfg.data_dir.display()))?;
        let feed = Arc::new(LocalChangeFeed::new());
        let aggregator = Aggregator::with_parts(
            store.clone(),
            store.clone(),
            store.clone(),
            feed.clone(),
            SystemClock,
            cfg.job.to_aggregator_config()?,
        );
        Ok(Self {
            aggregator: Arc::new(aggregator),
            store,
            feed,
            data_dir: cfg.data_dir.clone(),
            health: cfg.health.clone(),
            #[cfg(feature = "metrics")]
            metrics_handle: init_metrics_recorder(),
        })
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error(transparent)]
    Engine(#[from] HashflowError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::Engine(HashflowError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Engine(HashflowError::NotFound(_)) | ApiError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Engine(HashflowError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
struct CorrelationId(String);

async fn correlation_layer(mut req: Request<Body>, next: Next) -> impl IntoResponse {
    let header_key = axum::http::header::HeaderName::from_static("x-request-id");
    let cid = req
        .headers()
        .get(&header_key)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .map(|s: &str| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&cid) {
        req.headers_mut().insert(&header_key, value);
    }
    req.extensions_mut().insert(CorrelationId(cid.clone()));
    let span = info_span!(
        "http.request",
        request_id = %cid,
        method = %req.method(),
        path = %req.uri().path()
    );
    next.run(req).instrument(span).await
}

async fn execute_run(aggregator: Arc<HashtagAggregator>) -> ApiResult<JobOutcome> {
    tokio::task::spawn_blocking(move || aggregator.run_job())
        .await
        .map_err(|e| ApiError::Internal(format!("job task aborted: {e}")))?
        .map_err(ApiError::from)
}

async fn run_job_handler(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
) -> ApiResult<Json<JobOutcome>> {
    let span = info_span!("run_job", request_id = %correlation.0);
    let outcome = execute_run(state.aggregator.clone()).instrument(span).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<JobRecord>>> {
    Ok(Json(state.store.recent_jobs(query.limit.unwrap_or(10))?))
}

async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    state
        .store
        .get_job(&JobId::new(id.clone()))?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

#[derive(Debug, Deserialize)]
struct CountsQuery {
    window: Option<String>,
    limit: Option<usize>,
}

async fn counts_handler(
    State(state): State<AppState>,
    Query(query): Query<CountsQuery>,
) -> ApiResult<Json<Vec<WindowCounter>>> {
    let window = query.window.map(WindowKey::new);
    let counters = state
        .store
        .top_counters(window.as_ref(), query.limit.unwrap_or(20))?;
    Ok(Json(counters))
}

async fn list_records_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<Record>>> {
    Ok(Json(state.store.recent_records(query.limit.unwrap_or(20))?))
}

async fn submit_record_handler(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(new_record): Json<NewRecord>,
) -> ApiResult<(StatusCode, Json<Record>)> {
    let span = info_span!(
        "submit_record",
        request_id = %correlation.0,
        external_id = %new_record.external_id
    );
    let created_at = SystemClock
        .timestamp()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let record = state.store.insert_record(new_record, created_at)?;
    #[cfg(feature = "metrics")]
    hashflow_metrics::record_ingested(1);
    let _enter = span.enter();
    info!(record_id = %record.id, tags = record.tags.len(), "record accepted");
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    kinds: Vec<ChangeKind>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubscribeResponse {
    handle: FeedHandle,
}

async fn subscribe_handler(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Json<SubscribeResponse> {
    Json(SubscribeResponse {
        handle: state.feed.subscribe(req.kinds),
    })
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    max: Option<usize>,
}

async fn poll_events_handler(
    State(state): State<AppState>,
    Path(handle): Path<FeedHandle>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Json<Vec<ChangeEvent>>> {
    Ok(Json(state.feed.drain(handle, query.max.unwrap_or(100))?))
}

async fn unsubscribe_handler(
    State(state): State<AppState>,
    Path(handle): Path<FeedHandle>,
) -> StatusCode {
    if state.feed.stop(handle) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    disk_usage: Option<DiskUsage>,
    pending_records: Option<usize>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiskUsage {
    used_bytes: u64,
    total_bytes: u64,
    percent_used: f32,
}

fn disk_usage(path: &FsPath) -> Option<DiskUsage> {
    let total = fs2::total_space(path).ok()?;
    let avail = fs2::available_space(path).ok()?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(avail);
    let pct = (used as f64 / total as f64) as f32 * 100.0;
    Some(DiskUsage {
        used_bytes: used,
        total_bytes: total,
        percent_used: pct,
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let disk = disk_usage(&state.data_dir);
    let mut status = "ready".to_string();
    let mut message = None;
    if let Some(ref usage) = disk {
        let threshold = state.health.disk_usage_degraded * 100.0;
        if usage.percent_used >= threshold {
            status = "degraded".to_string();
            message = Some(format!(
                "disk usage {:.1}% >= {:.1}%",
                usage.percent_used, threshold
            ));
        }
        #[cfg(feature = "metrics")]
        hashflow_metrics::record_disk_usage(usage.used_bytes, usage.total_bytes);
    } else {
        status = "degraded".to_string();
        message = Some("unable to read disk usage".into());
    }

    let pending_records = match state.store.pending_records() {
        Ok(n) => Some(n),
        Err(err) => {
            status = "degraded".into();
            message = Some(err.to_string());
            None
        }
    };

    Json(HealthResponse {
        status,
        disk_usage: disk,
        pending_records,
        message,
    })
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let disk = disk_usage(&state.data_dir);
    let mut status = "ready".to_string();
    let mut message = None;
    if let Some(ref usage) = disk {
        let threshold = state.health.disk_usage_degraded * 100.0;
        if usage.percent_used >= threshold {
            status = "degraded".to_string();
            message = Some(format!(
                "disk usage {:.1}% >= {:.1}%",
                usage.percent_used, threshold
            ));
        }
    } else {
        // unknown, not fatal
        message = Some("disk usage unavailable".into());
    }

    let pending_records = match state.store.pending_records() {
        Ok(n) => Some(n),
        Err(err) => {
            status = "degraded".into();
            message = Some(format!("storage unavailable: {err}"));
            None
        }
    };

    let code = if status == "ready" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let resp = HealthResponse {
        status,
        disk_usage: disk,
        pending_records,
        message,
    };
    (code, Json(resp))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        body,
    )
}

fn build_router(state: AppState) -> Router {
    let app = Router::new()
        .route("/jobs/run", post(run_job_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/:id", get(get_job_handler))
        .route("/counts", get(counts_handler))
        .route("/records", get(list_records_handler).post(submit_record_handler))
        .route("/events/subscribe", post(subscribe_handler))
        .route(
            "/events/:handle",
            get(poll_events_handler).delete(unsubscribe_handler),
        )
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route_layer(middleware::from_fn(correlation_layer));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));
    app.with_state(state)
}

/// Trigger a run every `every`. Missed ticks are skipped; a slow run does not hold
/// back the next tick, so runs may overlap.
fn spawn_scheduler(aggregator: Arc<HashtagAggregator>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let aggregator = aggregator.clone();
            tokio::spawn(async move {
                match execute_run(aggregator).await {
                    Ok(outcome) => info!(
                        job_id = %outcome.job_id,
                        records = outcome.records_processed,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            });
        }
    })
}

fn load_config(path: &str) -> anyhow::Result<NodeConfig> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
    let cfg: ConfigWrapper = toml::from_str(&text)?;
    Ok(cfg.node)
}

fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

#[cfg(feature = "metrics")]
fn init_metrics_recorder() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let cfg_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|idx| args.get(idx + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");
    let cfg = load_config(cfg_path)?;

    let state = AppState::open(&cfg)?;
    if let Some(every) = cfg.job.schedule_interval()? {
        info!(interval = %humantime::format_duration(every), "scheduler enabled");
        spawn_scheduler(state.aggregator.clone(), every);
    }
    let app = build_router(state);

    let addr: SocketAddr = cfg
        .listen
        .as_deref()
        .unwrap_or("127.0.0.1:8080")
        .parse()
        .context("invalid listen addr")?;

    info!(%addr, "hashflow-node listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
