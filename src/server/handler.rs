use super::{full_body, sse, BoxBody, GatewayState};
use crate::convert::{convert, ConvertRequest, OutputFormat};
use crate::crawl::{run_crawl, CrawlEvent, CrawlRequest};
use crate::dispatch::{run_tasks, DispatchOptions, TaskFailure, TaskInput};
use crate::error::ConvertError;
use crate::metrics::RuntimeStats;
use crate::retry_token;
use crate::safety;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Request body / batch payload ceiling.
pub const MAX_BATCH_BYTES: usize = 100_000;
pub const MAX_BATCH_URLS: usize = 10;

/// Image proxy response cap.
const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

/// Route an incoming request. Never fails at the hyper level; every error
/// becomes a JSON error response per the taxonomy.
pub async fn handle_request<B>(
    req: Request<B>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    RuntimeStats::incr(&state.stats.requests_total);
    metrics::counter!("mdgate_http_requests_total").increment(1);

    let response = route(req, &state).await;

    info!(
        client = %peer_addr.ip(),
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = %started.elapsed().as_millis(),
        "access"
    );
    Ok(response)
}

async fn route<B>(req: Request<B>, state: &GatewayState) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    let path = req.uri().path().to_string();
    match (req.method().clone(), path.as_str()) {
        (Method::GET, "/") => landing_page(),
        (Method::GET, "/favicon.ico") => status_json(StatusCode::NOT_FOUND, json!({"error": "not found"})),
        (Method::GET, "/api/og") => og_image(&req),
        (Method::GET, "/api/stream") => stream_convert(&req, state),
        (Method::POST, "/api/batch") => batch_convert(req, state).await,
        (Method::POST, "/api/deepcrawl") => deep_crawl(req, state).await,
        (Method::POST, "/api/extract") => structured_extract(req, state).await,
        (Method::GET, p) if p.starts_with("/img/") => image_proxy(p, state).await,
        (Method::GET, p) if p.starts_with("/r2img/") => stored_image(p, state),
        (Method::GET, _) => sync_convert(&req, state).await,
        _ => status_json(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "method not allowed"}),
        ),
    }
}

// ---------------------------------------------------------------------------
// Small response helpers
// ---------------------------------------------------------------------------

fn status_json(status: StatusCode, body: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

fn error_response(e: &ConvertError) -> Response<BoxBody> {
    let status = e.status();
    status_json(
        status,
        json!({
            "error": retry_token::redact(&e.to_string()),
            "kind": e.kind(),
            "status": status.as_u16(),
        }),
    )
}

fn query_pairs(uri: &hyper::Uri) -> Vec<(String, String)> {
    url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

fn get_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn bool_param(params: &[(String, String)], name: &str) -> bool {
    matches!(get_param(params, name), Some("true") | Some("1") | Some(""))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// GET / — landing page
// ---------------------------------------------------------------------------

fn landing_page() -> Response<BoxBody> {
    let html = r#"<!doctype html>
<html><head><meta charset="utf-8"><title>mdgate</title>
<style>body{font-family:system-ui,sans-serif;max-width:42rem;margin:4rem auto;padding:0 1rem;color:#222}
code{background:#f4f4f4;padding:.1rem .3rem;border-radius:3px}</style></head>
<body>
<h1>mdgate</h1>
<p>URL-to-Markdown conversion gateway. Prefix any URL with this host:</p>
<p><code>GET /https://example.com/article</code></p>
<p>Query parameters: <code>format</code> (markdown, html, text, json),
<code>selector</code>, <code>force_browser</code>, <code>no_cache</code>, <code>raw</code>.</p>
<p>APIs: <code>POST /api/batch</code>, <code>POST /api/deepcrawl</code>,
<code>POST /api/extract</code>, <code>GET /api/stream?url=…</code></p>
</body></html>"#;
    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(html))
        .unwrap()
}

// ---------------------------------------------------------------------------
// GET /api/og — SVG OpenGraph image
// ---------------------------------------------------------------------------

fn og_image<B>(req: &Request<B>) -> Response<BoxBody> {
    let params = query_pairs(req.uri());
    let title = get_param(&params, "title").unwrap_or("mdgate");
    let title = safety::escape_html(&title.chars().take(120).collect::<String>());

    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="1200" height="630" viewBox="0 0 1200 630">
<rect width="1200" height="630" fill="#101418"/>
<text x="80" y="300" font-family="system-ui, sans-serif" font-size="56" fill="#e8e8e8">{}</text>
<text x="80" y="560" font-family="system-ui, sans-serif" font-size="28" fill="#7a8590">mdgate — read anything as markdown</text>
</svg>"##,
        title
    );
    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "image/svg+xml")
        .body(full_body(svg))
        .unwrap()
}

// ---------------------------------------------------------------------------
// GET /<url> — synchronous conversion
// ---------------------------------------------------------------------------

fn parse_convert_params<B>(req: &Request<B>) -> Result<ConvertRequest, ConvertError> {
    let params = query_pairs(req.uri());

    let format = match get_param(&params, "format") {
        Some(raw) => OutputFormat::from_str(raw)?,
        None => OutputFormat::Markdown,
    };
    let selector = get_param(&params, "selector").map(|s| s.to_string());
    if let Some(ref s) = selector {
        if s.len() > crate::convert::MAX_SELECTOR_LEN {
            return Err(ConvertError::InvalidSelector(format!(
                "selector exceeds {} chars",
                crate::convert::MAX_SELECTOR_LEN
            )));
        }
    }

    // The gateway owns its parameter names; all other query pairs belong
    // to the target URL and are passed through untouched.
    const OWN_PARAMS: &[&str] = &["format", "selector", "raw", "force_browser", "no_cache"];
    let passthrough: Vec<(String, String)> = params
        .iter()
        .filter(|(n, _)| !OWN_PARAMS.contains(&n.as_str()))
        .cloned()
        .collect();

    let mut target = percent_decode(req.uri().path().trim_start_matches('/'));
    if target.is_empty() {
        return Err(ConvertError::InvalidUrl("missing target url".into()));
    }
    if !passthrough.is_empty() {
        let mut encoder = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &passthrough {
            encoder.append_pair(name, value);
        }
        target.push('?');
        target.push_str(&encoder.finish());
    }

    let mut request = ConvertRequest::new(target);
    request.format = format;
    request.selector = selector;
    request.force_browser = bool_param(&params, "force_browser");
    request.no_cache = bool_param(&params, "no_cache");

    Ok(request)
}

async fn sync_convert<B>(req: &Request<B>, state: &GatewayState) -> Response<BoxBody> {
    let request = match parse_convert_params(req) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };

    let cancel = CancellationToken::new();
    match convert(state, request, &cancel).await {
        Ok(outcome) => {
            let mut builder = Response::builder()
                .status(200)
                .header(CONTENT_TYPE, outcome.format.content_type())
                .header("X-Conversion-Method", outcome.method.clone())
                .header("X-Cache", if outcome.cached { "HIT" } else { "MISS" });
            if outcome.method == "native" {
                builder = builder.header("X-Markdown-Native", "true");
            }
            if !outcome.fallbacks.is_empty() {
                builder = builder.header("X-Conversion-Fallbacks", outcome.fallbacks.join(","));
            }
            builder.body(full_body(outcome.content)).unwrap()
        }
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// GET /api/stream — SSE conversion progress
// ---------------------------------------------------------------------------

fn stream_convert<B>(req: &Request<B>, state: &GatewayState) -> Response<BoxBody> {
    let params = query_pairs(req.uri());
    let Some(url) = get_param(&params, "url").map(|s| s.to_string()) else {
        return error_response(&ConvertError::InvalidRequest("url parameter required".into()));
    };
    let selector = get_param(&params, "selector").map(|s| s.to_string());
    let format = match get_param(&params, "format") {
        Some(raw) => match OutputFormat::from_str(raw) {
            Ok(f) => f,
            Err(e) => return error_response(&e),
        },
        None => OutputFormat::Markdown,
    };

    let (tx, body) = sse::sse_channel(16);
    let state = state.clone();
    tokio::spawn(async move {
        tx.send("start", &json!({"url": url})).await;
        tx.send("progress", &json!({"stage": "fetching"})).await;

        let mut request = ConvertRequest::new(url.clone());
        request.format = format;
        request.selector = selector;
        let cancel = CancellationToken::new();

        match convert(&state, request, &cancel).await {
            Ok(outcome) => {
                tx.send(
                    "done",
                    &json!({
                        "url": outcome.url_final,
                        "title": outcome.title,
                        "content": outcome.content,
                        "method": outcome.method,
                        "cached": outcome.cached,
                        "elapsedMs": outcome.elapsed_ms,
                    }),
                )
                .await;
            }
            Err(e) => {
                tx.send(
                    "fail",
                    &json!({
                        "title": "conversion failed",
                        "message": retry_token::redact(&e.to_string()),
                        "status": e.status().as_u16(),
                    }),
                )
                .await;
            }
        }
    });

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(body)
        .unwrap()
}

// ---------------------------------------------------------------------------
// GET /img/<encoded_url> — SSRF-checked image proxy (SVG rejected)
// ---------------------------------------------------------------------------

async fn image_proxy(path: &str, state: &GatewayState) -> Response<BoxBody> {
    let target = percent_decode(path.trim_start_matches("/img/"));
    let allow_private = state.config.load().fetch.allow_private_networks;

    let url = match url::Url::parse(&target)
        .map_err(|e| ConvertError::InvalidUrl(format!("parse error: {}", e)))
        .and_then(|u| safety::validate_url_policy(&u, allow_private).map(|_| u))
    {
        Ok(u) => u,
        Err(e) => return error_response(&e),
    };

    let response = match state
        .http
        .get(url.as_str())
        .timeout(std::time::Duration::from_secs(15))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) if e.is_redirect() => {
            return error_response(&ConvertError::Blocked(format!("redirect rejected: {}", e)))
        }
        Err(e) => return error_response(&ConvertError::FetchFailed(e.to_string())),
    };

    if !response.status().is_success() {
        return error_response(&ConvertError::FetchFailed(format!(
            "image fetch Status: {}",
            response.status().as_u16()
        )));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    if content_type.starts_with("image/svg") {
        return error_response(&ConvertError::Blocked("SVG images are not proxied".into()));
    }

    let bytes = match response.bytes().await {
        Ok(b) if b.len() <= MAX_IMAGE_BYTES => b,
        Ok(_) => {
            return error_response(&ConvertError::FetchFailed("image exceeds size cap".into()))
        }
        Err(e) => return error_response(&ConvertError::FetchFailed(e.to_string())),
    };

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, content_type)
        .header("Cache-Control", "public, max-age=86400")
        .body(full_body(bytes))
        .unwrap()
}

// ---------------------------------------------------------------------------
// GET /r2img/<key> — stored image
// ---------------------------------------------------------------------------

fn stored_image(path: &str, state: &GatewayState) -> Response<BoxBody> {
    let key = path.trim_start_matches("/r2img/");
    let Some(store) = state.images.as_ref() else {
        return status_json(StatusCode::NOT_FOUND, json!({"error": "not found"}));
    };
    match store.get(key) {
        Some((bytes, mime)) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, mime)
            .header("Cache-Control", "public, max-age=86400")
            .body(full_body(bytes))
            .unwrap(),
        None => status_json(StatusCode::NOT_FOUND, json!({"error": "not found"})),
    }
}

// ---------------------------------------------------------------------------
// Bearer auth shared by /api/batch and /api/deepcrawl
// ---------------------------------------------------------------------------

fn check_auth<B>(req: &Request<B>, state: &GatewayState) -> Result<(), ConvertError> {
    let Some(expected) = state.api_token() else {
        return Err(ConvertError::Misconfigured("API_TOKEN not configured".into()));
    };
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(ConvertError::Unauthorized),
    }
}

async fn read_body_capped<B>(req: Request<B>) -> Result<Bytes, ConvertError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    if let Some(length) = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_BATCH_BYTES {
            return Err(ConvertError::RequestTooLarge(length));
        }
    }
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ConvertError::InvalidRequest(format!("body read failed: {}", e)))?
        .to_bytes();
    if bytes.len() > MAX_BATCH_BYTES {
        return Err(ConvertError::RequestTooLarge(bytes.len()));
    }
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// POST /api/batch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchItem {
    Url(String),
    Spec {
        url: String,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        force_browser: bool,
        #[serde(default)]
        no_cache: bool,
    },
}

#[derive(Debug, Deserialize)]
struct BatchPayload {
    urls: Vec<BatchItem>,
}

async fn batch_convert<B>(req: Request<B>, state: &GatewayState) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    if let Err(e) = check_auth(&req, state) {
        return error_response(&e);
    }
    let body = match read_body_capped(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };

    let payload: BatchPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return error_response(&ConvertError::InvalidRequest(format!(
                "invalid batch body: {}",
                e
            )))
        }
    };
    if payload.urls.is_empty() {
        return error_response(&ConvertError::InvalidRequest(
            "at least one URL is required".into(),
        ));
    }
    if payload.urls.len() > MAX_BATCH_URLS {
        return error_response(&ConvertError::InvalidRequest(format!(
            "Maximum {} URLs per batch (got {})",
            MAX_BATCH_URLS,
            payload.urls.len()
        )));
    }

    let mut tasks = Vec::with_capacity(payload.urls.len());
    for item in payload.urls {
        let request = match item {
            BatchItem::Url(url) => ConvertRequest::new(url),
            BatchItem::Spec {
                url,
                format,
                selector,
                force_browser,
                no_cache,
            } => {
                let mut request = ConvertRequest::new(url);
                if let Some(raw) = format {
                    request.format = match OutputFormat::from_str(&raw) {
                        Ok(f) => f,
                        Err(e) => return error_response(&e),
                    };
                }
                request.selector = selector;
                request.force_browser = force_browser;
                request.no_cache = no_cache;
                request
            }
        };
        tasks.push(TaskInput {
            url: Some(request.url.clone()),
            payload: request,
        });
    }

    let cfg = state.config.load();
    let options = DispatchOptions {
        concurrency: cfg.batch.concurrency,
        max_retries: cfg.batch.max_retries,
        base_delay_ms: cfg.batch.base_delay_ms,
        max_delay_ms: cfg.batch.max_delay_ms,
        rate_limit_codes: vec![429, 503],
        cancel: CancellationToken::new(),
    };
    drop(cfg);

    RuntimeStats::add(&state.stats.jobs_created, tasks.len() as u64);

    let inputs: Vec<(String, OutputFormat)> = tasks
        .iter()
        .map(|t| (t.payload.url.clone(), t.payload.format))
        .collect();

    let results = run_tasks(
        tasks,
        |request: &ConvertRequest| {
            let state = state.clone();
            let request = request.clone();
            let cancel = options.cancel.clone();
            async move {
                convert(&state, request, &cancel)
                    .await
                    .map_err(TaskFailure::from)
            }
        },
        &options,
        Some(&state.stats),
    )
    .await;

    let items: Vec<serde_json::Value> = results
        .into_iter()
        .zip(inputs)
        .map(|(result, (url, format))| match result {
            Ok(outcome) => {
                let content_key = match format {
                    OutputFormat::Markdown => "markdown",
                    _ => "content",
                };
                let mut item = serde_json::Map::new();
                item.insert("url".into(), json!(url));
                item.insert("format".into(), json!(format.as_str()));
                item.insert(content_key.into(), json!(outcome.content));
                item.insert("method".into(), json!(outcome.method));
                item.insert("cached".into(), json!(outcome.cached));
                item.insert("title".into(), json!(outcome.title));
                serde_json::Value::Object(item)
            }
            Err(e) => json!({
                "url": url,
                "error": retry_token::redact(&e.to_string()),
            }),
        })
        .collect();

    status_json(StatusCode::OK, json!({ "results": items }))
}

// ---------------------------------------------------------------------------
// POST /api/extract — structured extraction over fetched or supplied HTML
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExtractPayload {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    html: Option<String>,
    strategy: String,
    schema: serde_json::Value,
    #[serde(default)]
    selector_root: Option<String>,
}

async fn structured_extract<B>(req: Request<B>, state: &GatewayState) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    if let Err(e) = check_auth(&req, state) {
        return error_response(&e);
    }
    let body = match read_body_capped(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };
    let payload: ExtractPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            return error_response(&ConvertError::InvalidRequest(format!(
                "invalid extract body: {}",
                e
            )))
        }
    };
    let strategy = match crate::extract::ExtractionStrategy::from_str(&payload.strategy) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };

    // Inline HTML wins; otherwise the page is converted through the normal
    // pipeline (cache included) and its acquired HTML is extracted.
    let html = match (payload.html, payload.url) {
        (Some(html), _) => html,
        (None, Some(url)) => {
            let mut request = ConvertRequest::new(url);
            request.capture_html = true;
            request.no_cache = true;
            let cancel = CancellationToken::new();
            match convert(state, request, &cancel).await {
                Ok(outcome) => match outcome.source_html {
                    Some(html) => html,
                    None => {
                        return error_response(&ConvertError::UnsupportedContent(
                            "target produced no HTML to extract from".into(),
                        ))
                    }
                },
                Err(e) => return error_response(&e),
            }
        }
        (None, None) => {
            return error_response(&ConvertError::InvalidRequest(
                "either url or html is required".into(),
            ))
        }
    };

    match crate::extract::extract(strategy, &html, &payload.schema, payload.selector_root.as_deref())
    {
        Ok(result) => status_json(StatusCode::OK, json!({ "result": result })),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// POST /api/deepcrawl
// ---------------------------------------------------------------------------

async fn deep_crawl<B>(req: Request<B>, state: &GatewayState) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send,
    B::Error: std::fmt::Display,
{
    if let Err(e) = check_auth(&req, state) {
        return error_response(&e);
    }
    let body = match read_body_capped(req).await {
        Ok(b) => b,
        Err(e) => return error_response(&e),
    };

    let crawl_req: CrawlRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(&ConvertError::InvalidRequest(format!(
                "invalid crawl body: {}",
                e
            )))
        }
    };
    if let Err(e) = crawl_req.validate() {
        return error_response(&e);
    }

    if crawl_req.stream {
        let (tx, body) = sse::sse_channel(64);
        let state = state.clone();
        tokio::spawn(async move {
            let (etx, mut erx) = tokio::sync::mpsc::channel::<CrawlEvent>(64);
            let forward = async {
                while let Some(event) = erx.recv().await {
                    tx.send(event.name, &event.data).await;
                }
            };
            let crawl = async {
                let cancel = CancellationToken::new();
                if let Err(e) = run_crawl(&state, &crawl_req, Some(&etx), &cancel).await {
                    let _ = etx
                        .send(CrawlEvent {
                            name: "fail",
                            data: json!({
                                "title": "deep crawl failed",
                                "message": retry_token::redact(&e.to_string()),
                                "status": e.status().as_u16(),
                            }),
                        })
                        .await;
                }
                drop(etx);
            };
            tokio::join!(forward, crawl);
        });

        return Response::builder()
            .status(200)
            .header(CONTENT_TYPE, "text/event-stream")
            .header("Cache-Control", "no-cache")
            .body(body)
            .unwrap();
    }

    let cancel = CancellationToken::new();
    match run_crawl(state, &crawl_req, None, &cancel).await {
        Ok(summary) => status_json(
            StatusCode::OK,
            serde_json::to_value(&summary).unwrap_or_default(),
        ),
        Err(e) => error_response(&e),
    }
}
