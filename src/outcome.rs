use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::Value;

/// Largest non-streaming body scanned for a usage block.
const MAX_SCANNED_BODY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptClass {
    Success,
    /// Auth, rate-limit and server errors: another key may do better.
    Recoverable,
    /// Request errors that no other key would fix.
    Terminal,
}

pub fn classify_status(status: StatusCode) -> AttemptClass {
    if status.is_success() {
        return AttemptClass::Success;
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            AttemptClass::Recoverable
        }
        s if s.is_server_error() => AttemptClass::Recoverable,
        _ => AttemptClass::Terminal,
    }
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// Picks token usage out of a relayed response without holding on to it.
///
/// Event streams are parsed line by line as chunks arrive and only the
/// latest usage block is kept. Plain JSON bodies are buffered up to a limit
/// and parsed at the end.
#[derive(Debug)]
pub struct UsageScanner {
    mode: ScanMode,
    tokens: Option<u64>,
}

#[derive(Debug)]
enum ScanMode {
    Sse { pending: Vec<u8>, data: String },
    Json { body: Vec<u8>, overflow: bool },
}

impl UsageScanner {
    pub fn new(event_stream: bool) -> Self {
        let mode = if event_stream {
            ScanMode::Sse {
                pending: Vec::new(),
                data: String::new(),
            }
        } else {
            ScanMode::Json {
                body: Vec::new(),
                overflow: false,
            }
        };
        Self { mode, tokens: None }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        match &mut self.mode {
            ScanMode::Json { body, overflow } => {
                if *overflow || body.len() + chunk.len() > MAX_SCANNED_BODY {
                    *overflow = true;
                    body.clear();
                    return;
                }
                body.extend_from_slice(chunk);
            }
            ScanMode::Sse { pending, data } => {
                pending.extend_from_slice(chunk);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    if let Some(tokens) = sse_line(line.trim_end_matches(['\r', '\n']), data) {
                        self.tokens = Some(tokens);
                    }
                }
            }
        }
    }

    /// Usage seen so far, including any trailing unterminated event.
    pub fn finish(mut self) -> Option<u64> {
        match &mut self.mode {
            ScanMode::Json { body, overflow } => {
                if *overflow {
                    return None;
                }
                serde_json::from_slice::<Value>(body)
                    .ok()
                    .as_ref()
                    .and_then(usage_tokens)
            }
            ScanMode::Sse { pending, data } => {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(pending).into_owned();
                    if let Some(tokens) = sse_line(line.trim_end_matches('\r'), data) {
                        self.tokens = Some(tokens);
                    }
                }
                if let Some(tokens) = flush_event(data) {
                    self.tokens = Some(tokens);
                }
                self.tokens
            }
        }
    }
}

/// Handles one SSE line; returns usage when it completes an event.
fn sse_line(line: &str, data: &mut String) -> Option<u64> {
    if line.is_empty() {
        return flush_event(data);
    }
    if let Some(rest) = line.strip_prefix("data:") {
        if !data.is_empty() {
            data.push('\n');
        }
        data.push_str(rest.trim_start());
    }
    None
}

fn flush_event(data: &mut String) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let payload = std::mem::take(data);
    if payload.trim() == "[DONE]" {
        return None;
    }
    serde_json::from_str::<Value>(&payload)
        .ok()
        .as_ref()
        .and_then(usage_tokens)
}

/// Reads `usage` as OpenAI-compatible upstreams report it.
pub fn usage_tokens(value: &Value) -> Option<u64> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        return Some(total);
    }
    let pair = |a: &str, b: &str| -> Option<u64> {
        let x = usage.get(a).and_then(Value::as_u64);
        let y = usage.get(b).and_then(Value::as_u64);
        match (x, y) {
            (None, None) => None,
            (x, y) => Some(x.unwrap_or(0) + y.unwrap_or(0)),
        }
    };
    pair("prompt_tokens", "completion_tokens").or_else(|| pair("input_tokens", "output_tokens"))
}
