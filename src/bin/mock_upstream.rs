//! Stand-in for an OpenAI-compatible upstream, for trying the proxy locally.
//!
//! `?status=` or an `x-mock-status` header forces a status code. Keys
//! containing `broke` report a zero balance. With `PROXY_BASE` set a small
//! generator sends chat traffic through the proxy.

use std::{collections::HashMap, convert::Infallible, net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn forced_status(query: &HashMap<String, String>, headers: &HeaderMap) -> Option<StatusCode> {
    query
        .get("status")
        .map(String::as_str)
        .or_else(|| headers.get("x-mock-status").and_then(|v| v.to_str().ok()))
        .and_then(|raw| raw.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .filter(|status| !status.is_success())
}

fn failure(status: StatusCode) -> Response {
    let body = json!({
        "error": {"message": format!("mock failure {}", status.as_u16()), "type": "mock"}
    });
    (status, Json(body)).into_response()
}

async fn chat_completions(
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(status) = forced_status(&q, &headers) {
        return failure(status);
    }
    let model = body["model"].as_str().unwrap_or("mock-model").to_owned();

    if body["stream"].as_bool().unwrap_or(false) {
        let events = ["Hel", "lo", "!"]
            .into_iter()
            .map(|piece| {
                json!({"object": "chat.completion.chunk", "model": model,
                       "choices": [{"delta": {"content": piece}}]})
            })
            .chain(std::iter::once(json!({
                "object": "chat.completion.chunk", "model": model, "choices": [],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            })))
            .map(|event| format!("data: {event}\n\n"))
            .chain(std::iter::once("data: [DONE]\n\n".to_owned()))
            .collect::<Vec<_>>();

        let stream = async_stream::stream! {
            for event in events {
                tokio::time::sleep(Duration::from_millis(50)).await;
                yield Ok::<_, Infallible>(Bytes::from(event));
            }
        };
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| failure(StatusCode::INTERNAL_SERVER_ERROR));
    }

    Json(json!({
        "object": "chat.completion",
        "model": model,
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}}],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
    }))
    .into_response()
}

async fn embeddings(Query(q): Query<HashMap<String, String>>, headers: HeaderMap) -> Response {
    if let Some(status) = forced_status(&q, &headers) {
        return failure(status);
    }
    Json(json!({
        "object": "list",
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "usage": {"prompt_tokens": 4, "total_tokens": 4}
    }))
    .into_response()
}

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{"id": "mock-model", "object": "model"}, {"id": "mock-embed", "object": "model"}]
    }))
}

async fn user_info(headers: HeaderMap) -> Response {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return failure(StatusCode::UNAUTHORIZED);
    };
    let balance = if token.contains("broke") { "0" } else { "14.2" };
    Json(json!({
        "code": 20000,
        "status": true,
        "data": {"balance": balance, "totalBalance": balance}
    }))
    .into_response()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(models))
        .route("/v1/user/info", get(user_info));
    let bind_addr =
        std::env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:58088".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    info!(%addr, "mock upstream listening");

    let generator = spawn_generator();

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    if let Some(handle) = generator {
        let _ = handle.await;
    }
    Ok(())
}

fn spawn_generator() -> Option<JoinHandle<()>> {
    let proxy_base = std::env::var("PROXY_BASE").ok()?;
    let interval_ms: u64 = std::env::var("GEN_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);

    Some(tokio::spawn(async move {
        let client = Client::new();
        let mut i = 0u64;
        loop {
            let statuses = [200, 429, 200, 500];
            let code = statuses[(i as usize) % statuses.len()];
            let url = format!("{proxy_base}/v1/chat/completions?status={code}");
            let payload = json!({
                "model": "mock-model",
                "stream": i % 3 == 0,
                "messages": [{"role": "user", "content": "hi"}]
            });
            match client.post(&url).json(&payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        info!(%url, %status, "generated request");
                    } else {
                        warn!(%url, %status, body = %body, "generated request failed");
                    }
                }
                Err(err) => warn!(%url, error = %err, "generator request error"),
            }

            i = i.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }))
}
