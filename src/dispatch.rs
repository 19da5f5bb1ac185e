//! Request forwarding with per-request key selection and retry.
//!
//! Each inbound request walks `select -> forward -> classify`. Recoverable
//! failures (401/403/429/5xx, transport errors) move on to a key that has
//! not been tried for this request, up to `max_retries` extra attempts.
//! Every attempt is finalised exactly once by an [`AttemptGuard`], including
//! when the caller disconnects and the future or body stream is dropped.

use std::collections::HashSet;
use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::{AppContext, AttemptOutcome, AttemptRecord};
use crate::error::ProxyError;
use crate::headers::{relay_response_headers, sanitize_request_headers};
use crate::outcome::{AttemptClass, UsageScanner, classify_status, is_event_stream};
use crate::registry::preview_key;
use crate::stats::{DAY_FORMAT, local_day};
use crate::strategy::{SelectError, Selection, select_key};

const ERROR_BODY_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    /// The `model` field of a JSON body, when there is one.
    pub fn model(&self) -> Option<String> {
        if self.body.is_empty() {
            return None;
        }
        let value: Value = serde_json::from_slice(&self.body).ok()?;
        value
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_owned)
    }
}

pub enum ResponseBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, Result<Bytes, io::Error>>),
}

impl ResponseBody {
    pub async fn collect(self) -> Result<Bytes, io::Error> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Id of the key that produced this response.
    pub key_id: String,
    pub attempts: u32,
}

/// Maps an inbound path onto the upstream's `/v1` tree. Paths already under
/// `/v1` pass through; short aliases such as `/chat/completions` gain the
/// prefix.
pub fn upstream_path(path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    if path == "/v1" || path.starts_with("/v1/") {
        path
    } else {
        format!("/v1{path}")
    }
}

enum LastFailure {
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        key_id: String,
    },
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    ctx: AppContext,
}

impl Dispatcher {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.ctx.upstream.clone();
        let base = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{base}{}", upstream_path(path)));
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    /// Forwards `request`, retrying recoverable failures on other keys.
    ///
    /// When retries run out the last upstream status and body are returned
    /// as-is. Only an empty pool or a run of transport errors is an `Err`.
    pub async fn dispatch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let settings = self.ctx.settings.snapshot();
        let model = request.model();
        let model_name = model.as_deref().unwrap_or_default();
        let max_attempts = settings.max_retries.saturating_add(1);
        let url = self.upstream_url(&request.path, request.query.as_deref());
        let forwarded = sanitize_request_headers(&request.headers);
        debug!(
            path = %request.path,
            dropped = ?forwarded.dropped,
            "sanitized request headers"
        );

        let mut tried: HashSet<String> = HashSet::new();
        let mut last_failure: Option<LastFailure> = None;
        let mut attempt: u32 = 0;

        while attempt < max_attempts {
            let snapshot = self.ctx.registry.list();
            let selection = match select_key(&snapshot, model_name, &settings, &tried) {
                Ok(selection) => selection,
                Err(SelectError::NoActiveKeys) if last_failure.is_none() => {
                    warn!(path = %request.path, "no active API keys");
                    return Err(ProxyError::NoActiveKeys);
                }
                Err(_) => break,
            };
            drop(snapshot);

            attempt += 1;
            tried.insert(selection.key.clone());
            if self
                .ctx
                .registry
                .update_last_used(&selection.key, Utc::now().timestamp())
                .is_err()
            {
                debug!(key = %preview_key(&selection.key), "key removed after selection");
            }

            let guard = AttemptGuard::new(
                self.ctx.clone(),
                &selection,
                &request,
                model.clone(),
                attempt,
            );

            let send = self
                .ctx
                .client
                .request(request.method.clone(), url.clone())
                .headers(forwarded.headers.clone())
                .bearer_auth(&selection.key)
                .body(request.body.clone())
                .send();

            let response = match tokio::time::timeout(settings.request_timeout(), send).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    let message = err.to_string();
                    warn!(
                        key = %preview_key(&selection.key),
                        attempt,
                        error = %message,
                        "upstream request failed"
                    );
                    guard.fail(None, message.clone());
                    last_failure = Some(LastFailure::Transport(message));
                    continue;
                }
                Err(_) => {
                    let message = format!(
                        "no upstream response within {}s",
                        settings.request_timeout().as_secs()
                    );
                    warn!(key = %preview_key(&selection.key), attempt, "upstream request timed out");
                    guard.fail(None, message.clone());
                    last_failure = Some(LastFailure::Transport(message));
                    continue;
                }
            };

            let status = response.status();
            match classify_status(status) {
                AttemptClass::Success => {
                    info!(
                        key = %preview_key(&selection.key),
                        method = %request.method,
                        path = %request.path,
                        status = status.as_u16(),
                        attempt,
                        strategy = selection.strategy.name(),
                        "upstream accepted request"
                    );
                    return Ok(relay_success(response, guard, selection.id, attempt));
                }
                class => {
                    let headers = relay_response_headers(response.headers());
                    let body = read_error_body(response, settings.request_timeout()).await;
                    guard.fail(Some(status), format!("upstream returned {status}"));
                    let failure = LastFailure::Status {
                        status,
                        headers,
                        body,
                        key_id: selection.id.clone(),
                    };
                    if class == AttemptClass::Terminal {
                        info!(
                            key = %preview_key(&selection.key),
                            status = status.as_u16(),
                            attempt,
                            "upstream rejected request, not retrying"
                        );
                        return failure_response(failure, attempt);
                    }
                    warn!(
                        key = %preview_key(&selection.key),
                        status = status.as_u16(),
                        attempt,
                        max_attempts,
                        "recoverable upstream failure"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        match last_failure {
            Some(failure) => {
                warn!(path = %request.path, attempts = attempt, "retry budget exhausted");
                failure_response(failure, attempt)
            }
            None => Err(ProxyError::NoActiveKeys),
        }
    }
}

/// Collects an error body, giving up at `limit` or [`ERROR_BODY_LIMIT`]
/// bytes. Whatever arrived before that is kept.
async fn read_error_body(response: Response, limit: Duration) -> Bytes {
    let mut body = BytesMut::new();
    let mut chunks = response.bytes_stream();
    let collect = async {
        while let Some(Ok(chunk)) = chunks.next().await {
            let room = ERROR_BODY_LIMIT - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= ERROR_BODY_LIMIT {
                break;
            }
        }
    };
    if tokio::time::timeout(limit, collect).await.is_err() {
        debug!(received = body.len(), "upstream error body stalled");
    }
    body.freeze()
}

fn failure_response(failure: LastFailure, attempts: u32) -> Result<ProxyResponse, ProxyError> {
    match failure {
        LastFailure::Status {
            status,
            headers,
            body,
            key_id,
        } => Ok(ProxyResponse {
            status,
            headers,
            body: ResponseBody::Buffered(body),
            key_id,
            attempts,
        }),
        LastFailure::Transport(last_error) => Err(ProxyError::RetryBudgetExhausted {
            attempts,
            last_error,
        }),
    }
}

fn relay_success(
    response: Response,
    mut guard: AttemptGuard,
    key_id: String,
    attempts: u32,
) -> ProxyResponse {
    let status = response.status();
    let headers = relay_response_headers(response.headers());
    guard.begin_stream(status, UsageScanner::new(is_event_stream(response.headers())));
    let mut upstream = response.bytes_stream();

    let body = async_stream::stream! {
        let mut guard = guard;
        let mut failed = None;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    guard.observe(&chunk);
                    yield Ok(chunk);
                }
                Err(err) => {
                    failed = Some(err.to_string());
                    yield Err(io::Error::other(err));
                    break;
                }
            }
        }
        match failed {
            Some(message) => guard.fail(Some(status), message),
            None => guard.succeed(),
        }
    };

    ProxyResponse {
        status,
        headers,
        body: ResponseBody::Stream(Box::pin(body)),
        key_id,
        attempts,
    }
}

/// Records one attempt's outcome exactly once.
///
/// Dropping an unfinished guard counts as a caller disconnect: a failure if
/// no response had started, a partial success otherwise.
struct AttemptGuard {
    ctx: AppContext,
    key: String,
    key_id: String,
    method: String,
    path: String,
    model: Option<String>,
    attempt: u32,
    started: Instant,
    streaming: Option<(StatusCode, UsageScanner)>,
    finished: bool,
}

impl AttemptGuard {
    fn new(
        ctx: AppContext,
        selection: &Selection,
        request: &ProxyRequest,
        model: Option<String>,
        attempt: u32,
    ) -> Self {
        Self {
            ctx,
            key: selection.key.clone(),
            key_id: selection.id.clone(),
            method: request.method.to_string(),
            path: request.path.clone(),
            model,
            attempt,
            started: Instant::now(),
            streaming: None,
            finished: false,
        }
    }

    fn begin_stream(&mut self, status: StatusCode, scanner: UsageScanner) {
        self.streaming = Some((status, scanner));
    }

    fn observe(&mut self, chunk: &[u8]) {
        if let Some((_, scanner)) = self.streaming.as_mut() {
            scanner.feed(chunk);
        }
    }

    fn succeed(mut self) {
        let (status, tokens) = self.take_stream();
        self.finish(AttemptOutcome::Success, status, tokens, None);
    }

    fn fail(mut self, status: Option<StatusCode>, error: String) {
        let _ = self.take_stream();
        self.finish(AttemptOutcome::Error, status, 0, Some(error));
    }

    fn take_stream(&mut self) -> (Option<StatusCode>, u64) {
        match self.streaming.take() {
            Some((status, scanner)) => (Some(status), scanner.finish().unwrap_or(0)),
            None => (None, 0),
        }
    }

    fn finish(
        &mut self,
        outcome: AttemptOutcome,
        status: Option<StatusCode>,
        tokens: u64,
        error: Option<String>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;

        let now = Utc::now();
        let success = outcome.is_success();
        let registry = &self.ctx.registry;
        let recorded = if success {
            registry.record_success(&self.key, now.timestamp())
        } else {
            registry.record_failure(&self.key, now.timestamp())
        };
        if recorded.is_err() {
            debug!(key = %preview_key(&self.key), "key removed before its attempt finished");
        }

        let model = self.model.as_deref().unwrap_or("unknown");
        self.ctx
            .stats
            .record_request(&self.key, model, success, tokens, now);
        let usage = self.ctx.stats.current_window(&self.key, now).as_usage();
        let _ = registry.update_usage(&self.key, usage);

        let latency_ms = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        if outcome != AttemptOutcome::Success {
            debug!(
                key = %preview_key(&self.key),
                outcome = outcome.as_str(),
                status = status.map(|s| s.as_u16()),
                latency_ms,
                "attempt finished"
            );
        }

        self.ctx.emit(AttemptRecord {
            key_id: self.key_id.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            model: self.model.clone(),
            status: status.map(|s| s.as_u16()),
            outcome,
            error,
            tokens,
            latency_ms,
            attempt: self.attempt,
            created_at: now.timestamp(),
            day: local_day(now).format(DAY_FORMAT).to_string(),
        });
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.take_stream() {
            (Some(status), tokens) => self.finish(
                AttemptOutcome::Partial,
                Some(status),
                tokens,
                Some("caller disconnected mid-stream".to_owned()),
            ),
            (None, _) => self.finish(
                AttemptOutcome::Cancelled,
                None,
                0,
                Some("caller disconnected".to_owned()),
            ),
        }
    }
}
