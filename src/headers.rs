use reqwest::header::{HeaderMap, HeaderName};

/// Never forwarded upstream: client identity, hop-by-hop and credentials we
/// replace ourselves.
const BLOCKED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
    "cookie",
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-forwarded-server",
    "x-original-forwarded-for",
    "x-real-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "x-cluster-client-ip",
    "fastly-client-ip",
    "cdn-loop",
];

const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "cache-control",
    "content-type",
    "pragma",
    "user-agent",
];

/// Vendor headers OpenAI-compatible SDKs attach to requests.
const ALLOWED_PREFIXES: &[&str] = &["openai-", "x-stainless-", "anthropic-"];

#[derive(Debug, Clone, Default)]
pub struct SanitizedHeaders {
    pub headers: HeaderMap,
    pub forwarded: Vec<String>,
    pub dropped: Vec<String>,
}

/// Filters inbound headers down to what the upstream should see.
pub fn sanitize_request_headers(headers: &HeaderMap) -> SanitizedHeaders {
    let mut sanitized = SanitizedHeaders::default();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if should_forward_header(name) {
            sanitized.headers.append(name.clone(), value.clone());
            sanitized.forwarded.push(lower);
        } else {
            sanitized.dropped.push(lower);
        }
    }
    sanitized
}

fn should_forward_header(name: &HeaderName) -> bool {
    let lower = name.as_str();
    if BLOCKED_HEADERS.contains(&lower) {
        return false;
    }
    if ALLOWED_HEADERS.contains(&lower) {
        return true;
    }
    if ALLOWED_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return true;
    }
    lower.starts_with("x-") && !lower.starts_with("x-forwarded-")
}

/// Upstream response headers minus framing the server recomputes.
pub fn relay_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if matches!(
            lower,
            "transfer-encoding" | "connection" | "content-length" | "keep-alive"
        ) {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }
    relayed
}
