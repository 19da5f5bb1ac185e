use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::{
    Router,
    body::{self, Body},
    extract::{Path, Query, State},
    http::{Request, Response, StatusCode},
    response::Json,
    routing::{any, delete, get, patch, post},
};
use chrono::Utc;
use flowrelay::config::ConfigError;
use flowrelay::refresh::{KeyRefresh, RefreshError};
use flowrelay::stats::parse_day;
use flowrelay::store::RequestLogRecord;
use flowrelay::{
    ApiKey, AppContext, DailyStats, Dispatcher, ImportReport, KeyManager, KeyStore, ProxyError,
    ProxyRequest, ProxyResponse, RefreshCollector, RefreshReport, ResponseBody, Settings, Strategy,
    WindowStats,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const BODY_LIMIT: usize = 32 * 1024 * 1024;
const DEFAULT_LOG_LIMIT: usize = 50;

pub struct AppState {
    pub ctx: AppContext,
    pub dispatcher: Dispatcher,
    pub manager: KeyManager,
    pub refresher: RefreshCollector,
    pub store: Arc<KeyStore>,
}

impl AppState {
    pub fn new(ctx: AppContext, store: Arc<KeyStore>) -> Self {
        Self {
            dispatcher: Dispatcher::new(ctx.clone()),
            manager: KeyManager::new(ctx.clone(), store.clone()),
            refresher: RefreshCollector::new(ctx.clone()),
            store,
            ctx,
        }
    }
}

async fn health_check() -> &'static str {
    "ok"
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/summary", get(fetch_summary))
        .route("/api/keys", get(list_keys).post(create_api_key).delete(prune_keys))
        .route("/api/keys/import", post(import_api_keys))
        .route("/api/keys/:id", delete(delete_api_key))
        .route("/api/keys/:id/status", patch(update_api_key_status))
        .route("/api/keys/:id/refresh", post(refresh_api_key))
        .route("/api/logs", get(list_logs))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/reload", post(reload_settings))
        .route(
            "/api/strategies",
            post(set_model_strategy).delete(remove_model_strategy),
        )
        .route("/request-stats/current", get(current_stats))
        .route("/request-stats/daily", get(daily_stats))
        .route("/request-stats/daily/:date", get(daily_stats_for))
        .route("/keys/refresh", post(refresh_all_keys))
        .route("/v1/*path", any(proxy_handler))
        .route("/chat", any(proxy_handler))
        .route("/chat/*path", any(proxy_handler))
        .route("/completions", any(proxy_handler))
        .route("/embeddings", any(proxy_handler))
        .route("/images", any(proxy_handler))
        .route("/images/*path", any(proxy_handler))
        .route("/models", any(proxy_handler))
        .route("/rerank", any(proxy_handler))
        .route("/user/info", any(proxy_handler))
        .with_state(state)
}

/// Serves until `shutdown` fires, then lets open connections finish.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    info!(
        addr = %bound_addr,
        upstream = %state.ctx.upstream,
        keys = state.ctx.registry.len(),
        "flowrelay listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ----- Proxy -----

async fn proxy_handler(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = match body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return openai_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "request body too large",
            );
        }
    };

    let request = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers,
        body,
    };

    match state.dispatcher.dispatch(request).await {
        Ok(response) => build_response(response),
        Err(ProxyError::NoActiveKeys) => openai_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_active_keys",
            "no active API keys available",
        ),
        Err(err) => {
            warn!(error = %err, "proxy request failed");
            openai_error(StatusCode::BAD_GATEWAY, "upstream_error", &err.to_string())
        }
    }
}

fn build_response(resp: ProxyResponse) -> Response<Body> {
    let body = match resp.body {
        ResponseBody::Buffered(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut response = Response::new(body);
    *response.status_mut() = resp.status;
    response.headers_mut().extend(resp.headers);
    response
}

/// Error body in the shape OpenAI clients already parse.
fn openai_error(status: StatusCode, kind: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": kind,
            "code": status.as_u16(),
        }
    });
    (status, Json(body)).into_response()
}

// ----- Keys -----

#[derive(Debug, Serialize)]
struct ApiKeyView {
    id: String,
    preview: String,
    enabled: bool,
    balance: f64,
    requests_per_minute: u32,
    tokens_per_minute: u64,
    success_count: u64,
    failure_count: u64,
    success_rate: f64,
    score: f64,
    last_used_at: Option<i64>,
    balance_checked_at: Option<i64>,
    created_at: i64,
}

impl From<ApiKey> for ApiKeyView {
    fn from(key: ApiKey) -> Self {
        Self {
            preview: key.preview(),
            success_rate: key.success_rate(),
            score: key.score(),
            last_used_at: (key.last_used_at > 0).then_some(key.last_used_at),
            id: key.id,
            enabled: key.enabled,
            balance: key.balance,
            requests_per_minute: key.requests_per_minute,
            tokens_per_minute: key.tokens_per_minute,
            success_count: key.success_count,
            failure_count: key.failure_count,
            balance_checked_at: key.balance_checked_at,
            created_at: key.created_at,
        }
    }
}

fn management_error(context: &str, err: ProxyError) -> StatusCode {
    match err {
        ProxyError::KeyNotFound => StatusCode::NOT_FOUND,
        ProxyError::DuplicateKey => StatusCode::CONFLICT,
        ProxyError::EmptyKey => StatusCode::BAD_REQUEST,
        other => {
            error!(error = %other, "{context}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn list_keys(State(state): State<Arc<AppState>>) -> Json<Vec<ApiKeyView>> {
    Json(
        state
            .manager
            .list()
            .into_iter()
            .map(ApiKeyView::from)
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    api_key: String,
}

#[derive(Debug, Serialize)]
struct CreateKeyResponse {
    id: String,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreateKeyResponse>), StatusCode> {
    let key = state
        .manager
        .add_key(&payload.api_key)
        .await
        .map_err(|err| management_error("create api key failed", err))?;
    let id = key.id.clone();
    check_new_balances(&state, vec![key]).await;
    Ok((StatusCode::CREATED, Json(CreateKeyResponse { id })))
}

async fn import_api_keys(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ImportReport>, StatusCode> {
    let report = state
        .manager
        .import_keys(&body)
        .await
        .map_err(|err| management_error("import api keys failed", err))?;
    let added = report
        .added
        .iter()
        .filter_map(|id| state.manager.find(id).ok())
        .collect();
    check_new_balances(&state, added).await;
    Ok(Json(report))
}

/// Balance check for freshly added keys. A failed check leaves the key as it
/// is until the next refresh cycle.
async fn check_new_balances(state: &AppState, keys: Vec<ApiKey>) {
    let concurrency = state.ctx.settings.snapshot().refresh_concurrency.max(1);
    let refresher = &state.refresher;
    futures_util::stream::iter(keys)
        .map(|key| async move {
            if let Err(err) = refresher.refresh_key(&key.key).await {
                warn!(key = %key.preview(), error = %err, "initial balance check failed");
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<()>>()
        .await;
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    state
        .manager
        .delete_key(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|err| management_error("delete api key failed", err))
}

#[derive(Debug, Deserialize)]
struct PruneQuery {
    below: Option<f64>,
}

#[derive(Debug, Serialize)]
struct PruneResponse {
    removed: Vec<String>,
}

async fn prune_keys(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PruneQuery>,
) -> Result<Json<PruneResponse>, StatusCode> {
    state
        .manager
        .delete_low_balance(q.below)
        .await
        .map(|removed| Json(PruneResponse { removed }))
        .map_err(|err| management_error("low balance cleanup failed", err))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyStatus {
    status: String,
}

async fn update_api_key_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateKeyStatus>,
) -> Result<Json<ApiKeyView>, StatusCode> {
    let enabled = match payload.status.trim().to_ascii_lowercase().as_str() {
        "active" | "enabled" => true,
        "disabled" => false,
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    state
        .manager
        .set_enabled(&id, enabled)
        .await
        .map(|key| Json(key.into()))
        .map_err(|err| management_error("update api key status failed", err))
}

async fn refresh_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<KeyRefresh>, StatusCode> {
    let key = state
        .manager
        .find(&id)
        .map_err(|err| management_error("refresh api key failed", err))?;
    match state.refresher.refresh_key(&key.key).await {
        Ok(refresh) => Ok(Json(refresh)),
        Err(RefreshError::KeyRemoved) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            warn!(id, error = %err, "manual balance refresh failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn refresh_all_keys(State(state): State<Arc<AppState>>) -> Json<RefreshReport> {
    Json(state.refresher.refresh_balances().await)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsQuery>,
) -> Result<Json<Vec<RequestLogRecord>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 500);
    state
        .store
        .recent_logs(limit)
        .await
        .map(Json)
        .map_err(|err| management_error("list logs failed", err))
}

// ----- Settings -----

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(Settings::clone(&state.ctx.settings.snapshot()))
}

async fn reload_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Settings>, (StatusCode, String)> {
    match state.ctx.settings.reload() {
        Ok(settings) => Ok(Json(Settings::clone(&settings))),
        Err(err) => Err(config_error(err)),
    }
}

fn config_error(err: ConfigError) -> (StatusCode, String) {
    let status = match &err {
        ConfigError::NoSource => StatusCode::BAD_REQUEST,
        ConfigError::Parse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, "settings change rejected");
    (status, err.to_string())
}

#[derive(Debug, Deserialize)]
struct ModelStrategyRequest {
    model: String,
    strategy: Strategy,
}

#[derive(Debug, Deserialize)]
struct ModelQuery {
    model: String,
}

async fn set_model_strategy(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ModelStrategyRequest>,
) -> Result<Json<Settings>, (StatusCode, String)> {
    let model = payload.model.trim().to_owned();
    if model.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "model must not be empty".to_owned()));
    }
    let (updated, ()) = state
        .ctx
        .settings
        .commit(|settings| {
            settings
                .model_key_strategies
                .insert(model.clone(), payload.strategy)
        })
        .await
        .map_err(config_error)?;
    info!(model = %model, strategy = payload.strategy.name(), "model strategy set");
    Ok(Json(Settings::clone(&updated)))
}

async fn remove_model_strategy(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<Settings>, (StatusCode, String)> {
    let not_found = || (StatusCode::NOT_FOUND, format!("no strategy for {}", q.model));
    let configured = state
        .ctx
        .settings
        .snapshot()
        .model_key_strategies
        .iter()
        .any(|(name, _)| name == q.model);
    if !configured {
        return Err(not_found());
    }
    let (updated, removed) = state
        .ctx
        .settings
        .commit(|settings| settings.model_key_strategies.remove(&q.model))
        .await
        .map_err(config_error)?;
    if removed.is_none() {
        return Err(not_found());
    }
    info!(model = %q.model, "model strategy removed");
    Ok(Json(Settings::clone(&updated)))
}

// ----- Stats -----

#[derive(Debug, Serialize)]
struct SummaryView {
    total_keys: usize,
    enabled_keys: usize,
    total_balance: f64,
    default_strategy: &'static str,
    current: WindowStats,
    today: Option<DailyStats>,
}

async fn fetch_summary(State(state): State<Arc<AppState>>) -> Json<SummaryView> {
    let keys = state.ctx.registry.list();
    let now = Utc::now();
    Json(SummaryView {
        total_keys: keys.len(),
        enabled_keys: keys.iter().filter(|k| k.enabled).count(),
        total_balance: keys.iter().map(|k| k.balance).sum(),
        default_strategy: state.ctx.settings.snapshot().default_strategy.name(),
        current: state.ctx.stats.current_total(now),
        today: state.ctx.stats.daily(flowrelay::stats::local_day(now)),
    })
}

#[derive(Debug, Serialize)]
struct KeyWindowView {
    id: String,
    preview: String,
    #[serde(flatten)]
    window: WindowStats,
}

#[derive(Debug, Serialize)]
struct CurrentStatsView {
    total: WindowStats,
    keys: Vec<KeyWindowView>,
}

async fn current_stats(State(state): State<Arc<AppState>>) -> Json<CurrentStatsView> {
    let now = Utc::now();
    let windows = state.ctx.stats.current_windows(now);
    let keys = state
        .ctx
        .registry
        .list()
        .into_iter()
        .filter_map(|key| {
            let window = *windows.get(&key.key)?;
            Some(KeyWindowView {
                preview: key.preview(),
                id: key.id,
                window,
            })
        })
        .collect();
    Json(CurrentStatsView {
        total: state.ctx.stats.current_total(now),
        keys,
    })
}

async fn daily_stats(State(state): State<Arc<AppState>>) -> Json<Vec<DailyStats>> {
    Json(state.ctx.stats.daily_all())
}

async fn daily_stats_for(
    State(state): State<Arc<AppState>>,
    Path(date): Path<String>,
) -> Result<Json<DailyStats>, StatusCode> {
    let day = parse_day(&date).ok_or(StatusCode::BAD_REQUEST)?;
    state
        .ctx
        .stats
        .daily(day)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
