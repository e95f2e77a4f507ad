use super::handler::handle_request;
use super::GatewayState;
use crate::browser::{BrowserEngine, Page};
use crate::config::GatewayConfig;
use crate::error::ConvertError;
use crate::retry_token::{CapturedCookie, RetryTokenStore};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

type Routes = HashMap<String, (u16, &'static str, String)>;

/// Minimal canned-response HTTP server for exercising the pipeline
/// end to end against loopback.
async fn spawn_upstream(routes: Routes) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).into_owned();
                let path = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                let (status, content_type, body) = routes
                    .get(&path)
                    .cloned()
                    .unwrap_or((404, "text/html", "<p>not found</p>".to_string()));
                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    403 => "Forbidden",
                    _ => "",
                };
                let resp = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    content_type,
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

fn test_state() -> GatewayState {
    let mut config = GatewayConfig::default();
    config.fetch.allow_private_networks = true;
    config.api_token = Some("test-token".to_string());
    GatewayState::new(config).unwrap()
}

fn peer() -> SocketAddr {
    "127.0.0.1:55555".parse().unwrap()
}

async fn call(
    state: &GatewayState,
    request: Request<Full<Bytes>>,
) -> (Response<super::BoxBody>, String) {
    let response = handle_request(request, state.clone(), peer()).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (
        Response::from_parts(parts, super::full_body(Bytes::new())),
        String::from_utf8_lossy(&bytes).into_owned(),
    )
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn post_json(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    builder
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Sync conversion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_native_markdown_passthrough() {
    let addr = spawn_upstream(HashMap::from([(
        "/a".to_string(),
        (200, "text/markdown", "# native markdown".to_string()),
    )]))
    .await;

    let state = test_state();
    let (resp, body) = call(&state, get(&format!("/http://{}/a?raw=true", addr))).await;

    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/markdown"));
    assert_eq!(
        resp.headers().get("X-Markdown-Native").unwrap(),
        "true"
    );
    assert_eq!(body, "# native markdown");
}

#[tokio::test]
async fn test_selector_scoped_text_output() {
    let html = r#"<html><body><div class="sidebar">Noise</div>
        <article class="main"><h1>Hello</h1><p>World</p></article></body></html>"#;
    let addr = spawn_upstream(HashMap::from([(
        "/t".to_string(),
        (200, "text/html", html.to_string()),
    )]))
    .await;

    let state = test_state();
    let (resp, body) = call(
        &state,
        get(&format!(
            "/http://{}/t?raw=true&format=text&selector=.main",
            addr
        )),
    )
    .await;

    assert_eq!(resp.status(), 200);
    assert!(body.contains("Hello"));
    assert!(body.contains("World"));
    assert!(!body.contains("Noise"));
}

#[tokio::test]
async fn test_cache_idempotence() {
    let addr = spawn_upstream(HashMap::from([(
        "/cached".to_string(),
        (
            200,
            "text/html",
            "<article><h1>Title</h1><p>Body text of the page</p></article>".to_string(),
        ),
    )]))
    .await;

    let state = test_state();
    let uri = format!("/http://{}/cached", addr);

    let (first, body1) = call(&state, get(&uri)).await;
    assert_eq!(first.headers().get("X-Cache").unwrap(), "MISS");

    let (second, body2) = call(&state, get(&uri)).await;
    assert_eq!(second.headers().get("X-Cache").unwrap(), "HIT");
    assert_eq!(body1, body2);
}

#[tokio::test]
async fn test_invalid_format_and_url() {
    let state = test_state();
    let (resp, body) = call(&state, get("/http://example.com/a?format=docx")).await;
    assert_eq!(resp.status(), 400);
    assert!(body.contains("InvalidFormat"));

    let (resp, _) = call(&state, get("/ftp://example.com/a")).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_upstream_error_maps_to_fetch_failed() {
    let addr = spawn_upstream(HashMap::new()).await;
    let state = test_state();
    let (resp, body) = call(&state, get(&format!("/http://{}/missing", addr))).await;
    assert_eq!(resp.status(), 502);
    assert!(body.contains("FetchFailed"));
    assert!(body.contains("404"));
}

#[tokio::test]
async fn test_unsupported_content_type() {
    let addr = spawn_upstream(HashMap::from([(
        "/pic".to_string(),
        (200, "image/png", "PNGDATA".to_string()),
    )]))
    .await;
    let state = test_state();
    let (resp, body) = call(&state, get(&format!("/http://{}/pic", addr))).await;
    assert_eq!(resp.status(), 415);
    assert!(body.contains("UnsupportedContent"));
}

#[tokio::test]
async fn test_landing_page_and_og() {
    let state = test_state();
    let (resp, body) = call(&state, get("/")).await;
    assert_eq!(resp.status(), 200);
    assert!(body.contains("mdgate"));

    let (resp, body) = call(&state, get("/api/og?title=Hello%20%3Cworld%3E")).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/svg+xml");
    assert!(body.contains("Hello &lt;world&gt;"));
}

// ---------------------------------------------------------------------------
// Browser path (mock engine)
// ---------------------------------------------------------------------------

struct MockPage {
    html: String,
}

#[async_trait]
impl Page for MockPage {
    async fn navigate(&self, _url: &str, _timeout: Duration) -> Result<(), ConvertError> {
        Ok(())
    }
    async fn set_user_agent(&self, _ua: &str) -> Result<(), ConvertError> {
        Ok(())
    }
    async fn set_extra_headers(&self, _h: &[(String, String)]) -> Result<(), ConvertError> {
        Ok(())
    }
    async fn content(&self) -> Result<String, ConvertError> {
        Ok(self.html.clone())
    }
    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, ConvertError> {
        Ok(serde_json::Value::Null)
    }
    async fn cookies(&self) -> Result<Vec<CapturedCookie>, ConvertError> {
        Ok(Vec::new())
    }
}

struct MockEngine {
    html: String,
}

#[async_trait]
impl BrowserEngine for MockEngine {
    async fn new_page(&self) -> Result<Box<dyn Page>, ConvertError> {
        Ok(Box::new(MockPage {
            html: self.html.clone(),
        }))
    }
}

#[tokio::test]
async fn test_force_browser_uses_engine() {
    let mut state = test_state();
    state.browser = Some(Arc::new(MockEngine {
        html: "<html><body><article><h1>Rendered</h1><p>From the browser engine page</p></article></body></html>"
            .to_string(),
    }));

    let (resp, body) = call(&state, get("/http://site.example/doc?force_browser=true")).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("X-Conversion-Method").unwrap(),
        "browser+readability+turndown"
    );
    assert!(body.contains("# Rendered"));
}

#[tokio::test]
async fn test_browser_required_without_engine_fails() {
    let state = test_state();
    let (resp, body) = call(&state, get("/http://x.example/a?force_browser=true")).await;
    assert_eq!(resp.status(), 502);
    assert!(body.contains("no engine"));
}

// ---------------------------------------------------------------------------
// Proxy retry signalled from the browser path
// ---------------------------------------------------------------------------

struct RetrySignalEngine {
    tokens: Arc<RetryTokenStore>,
}

struct RetrySignalPage {
    tokens: Arc<RetryTokenStore>,
}

#[async_trait]
impl Page for RetrySignalPage {
    async fn navigate(&self, _url: &str, _timeout: Duration) -> Result<(), ConvertError> {
        let marker = self
            .tokens
            .create_retry_signal(&[CapturedCookie {
                name: "session".into(),
                value: "captured".into(),
            }])
            .await;
        Err(ConvertError::FetchFailed(format!(
            "login wall detected {}",
            marker
        )))
    }
    async fn set_user_agent(&self, _ua: &str) -> Result<(), ConvertError> {
        Ok(())
    }
    async fn set_extra_headers(&self, _h: &[(String, String)]) -> Result<(), ConvertError> {
        Ok(())
    }
    async fn content(&self) -> Result<String, ConvertError> {
        Ok(String::new())
    }
    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, ConvertError> {
        Ok(serde_json::Value::Null)
    }
    async fn cookies(&self) -> Result<Vec<CapturedCookie>, ConvertError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl BrowserEngine for RetrySignalEngine {
    async fn new_page(&self) -> Result<Box<dyn Page>, ConvertError> {
        Ok(Box::new(RetrySignalPage {
            tokens: self.tokens.clone(),
        }))
    }
}

/// Forward proxy stub: asserts the captured cookie arrived, then serves a
/// body long enough to pass the acceptance floor.
async fn spawn_proxy_expecting_cookie() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let req = String::from_utf8_lossy(&buf[..n]).into_owned();
                assert!(req.contains("Cookie: session=captured"), "req: {}", req);
                assert!(req.contains("Proxy-Authorization: Basic "));
                let article = format!(
                    "<html><body><article><h1>Unblocked</h1><p>{}</p></article></body></html>",
                    "real content ".repeat(150)
                );
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
                    article.len(),
                    article
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_browser_retry_signal_falls_back_to_proxy() {
    let proxy_addr = spawn_proxy_expecting_cookie().await;

    let mut config = GatewayConfig::default();
    config.fetch.allow_private_networks = true;
    config.proxy_url = Some(format!("user:pass@127.0.0.1:{}", proxy_addr.port()));
    let mut state = GatewayState::new(config).unwrap();
    state.browser = Some(Arc::new(RetrySignalEngine {
        tokens: state.retry_tokens.clone(),
    }));

    let (resp, body) = call(&state, get("/http://site.example/gated?force_browser=true")).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("X-Conversion-Method").unwrap(), "proxy");
    assert!(body.contains("Unblocked"));
}

#[tokio::test]
async fn test_retry_signal_without_proxy_is_terminal() {
    let mut state = test_state();
    state.browser = Some(Arc::new(RetrySignalEngine {
        tokens: state.retry_tokens.clone(),
    }));

    let (resp, body) = call(&state, get("/http://site.example/gated?force_browser=true")).await;
    assert_eq!(resp.status(), 502);
    assert!(body.contains("PROXY_URL"));
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batch_auth_required() {
    let state = test_state();
    let (resp, _) = call(
        &state,
        post_json("/api/batch", None, serde_json::json!({"urls": ["https://example.com"]})),
    )
    .await;
    assert_eq!(resp.status(), 401);

    let (resp, _) = call(
        &state,
        post_json(
            "/api/batch",
            Some("wrong"),
            serde_json::json!({"urls": ["https://example.com"]}),
        ),
    )
    .await;
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_batch_misconfigured_without_token() {
    let mut config = GatewayConfig::default();
    config.fetch.allow_private_networks = true;
    let state = GatewayState::new(config).unwrap();
    let (resp, _) = call(
        &state,
        post_json(
            "/api/batch",
            Some("anything"),
            serde_json::json!({"urls": ["https://example.com"]}),
        ),
    )
    .await;
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_batch_content_length_cap() {
    let state = test_state();
    let request = Request::builder()
        .method("POST")
        .uri("/api/batch")
        .header("Authorization", "Bearer test-token")
        .header("Content-Length", "100001")
        .body(Full::new(Bytes::from("{}")))
        .unwrap();
    let (resp, body) = call(&state, request).await;
    assert_eq!(resp.status(), 413);
    assert!(body.contains("Request too large"));
}

#[tokio::test]
async fn test_batch_url_count_cap() {
    let state = test_state();
    let urls: Vec<String> = (0..11).map(|i| format!("https://example.com/{}", i)).collect();
    let (resp, body) = call(
        &state,
        post_json("/api/batch", Some("test-token"), serde_json::json!({ "urls": urls })),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(body.contains("Maximum 10 URLs"));
}

#[tokio::test]
async fn test_batch_converts_and_isolates_item_errors() {
    let addr = spawn_upstream(HashMap::from([(
        "/ok".to_string(),
        (
            200,
            "text/html",
            "<article><h1>Batch</h1><p>item body content</p></article>".to_string(),
        ),
    )]))
    .await;

    let state = test_state();
    let payload = serde_json::json!({
        "urls": [
            format!("http://{}/ok", addr),
            {"url": format!("http://{}/gone", addr), "format": "text"},
        ]
    });
    let (resp, body) = call(&state, post_json("/api/batch", Some("test-token"), payload)).await;
    assert_eq!(resp.status(), 200);

    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    let results = parsed["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0]["markdown"].as_str().unwrap().contains("# Batch"));
    assert!(results[0]["error"].is_null());
    assert!(results[1]["error"].as_str().unwrap().contains("404"));
}

// ---------------------------------------------------------------------------
// Deep crawl
// ---------------------------------------------------------------------------

fn crawl_site() -> Routes {
    let page = |title: &str, links: &str| {
        (
            200,
            "text/html",
            format!(
                "<html><head><title>{}</title></head><body><article><h1>{}</h1><p>page body with enough text to clear the content probe threshold for the readability selection pass</p>{}</article></body></html>",
                title, title, links
            ),
        )
    };
    HashMap::from([
        (
            "/".to_string(),
            page(
                "Root",
                r#"<a href="/b">Beta page</a> <a href="/c">Gamma page</a>"#,
            ),
        ),
        ("/b".to_string(), page("Beta", "")),
        ("/c".to_string(), page("Gamma", "")),
    ])
}

#[tokio::test]
async fn test_deepcrawl_checkpoint_and_resume() {
    let addr = spawn_upstream(crawl_site()).await;

    let state = test_state();

    let first = serde_json::json!({
        "seed": format!("http://{}/", addr),
        "max_depth": 2,
        "max_pages": 2,
        "checkpoint": {"crawl_id": "r", "snapshot_interval": 1},
    });
    let (resp, body) = call(&state, post_json("/api/deepcrawl", Some("test-token"), first)).await;
    assert_eq!(resp.status(), 200, "body: {}", body);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["resumed"], false);
    let first_count = parsed["results"].as_array().unwrap().len();
    assert_eq!(first_count, 2);
    assert_eq!(parsed["stats"]["succeededPages"], 2);

    let second = serde_json::json!({
        "seed": format!("http://{}/", addr),
        "max_depth": 2,
        "max_pages": 5,
        "checkpoint": {"crawl_id": "r", "resume": true},
    });
    let (resp, body) = call(&state, post_json("/api/deepcrawl", Some("test-token"), second)).await;
    assert_eq!(resp.status(), 200, "body: {}", body);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["resumed"], true);
    assert!(parsed["results"].as_array().unwrap().len() > 2);
}

#[tokio::test]
async fn test_deepcrawl_validation_errors() {
    let state = test_state();

    // Non-integer numeric
    let (resp, _) = call(
        &state,
        post_json(
            "/api/deepcrawl",
            Some("test-token"),
            serde_json::json!({"seed": "https://example.com", "max_depth": 1.5}),
        ),
    )
    .await;
    assert_eq!(resp.status(), 400);

    // resume without crawl_id
    let (resp, body) = call(
        &state,
        post_json(
            "/api/deepcrawl",
            Some("test-token"),
            serde_json::json!({"seed": "https://example.com", "checkpoint": {"resume": true}}),
        ),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(body.contains("crawl_id"));
}

// ---------------------------------------------------------------------------
// Image endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_image_proxy_rejects_svg() {
    let addr = spawn_upstream(HashMap::from([
        (
            "/logo.svg".to_string(),
            (200, "image/svg+xml", "<svg/>".to_string()),
        ),
        (
            "/photo.png".to_string(),
            (200, "image/png", "PNGBYTES".to_string()),
        ),
    ]))
    .await;

    let state = test_state();
    let (resp, _) = call(
        &state,
        get(&format!("/img/http%3A%2F%2F{}%2Flogo.svg", addr)),
    )
    .await;
    assert_eq!(resp.status(), 403);

    let (resp, body) = call(
        &state,
        get(&format!("/img/http%3A%2F%2F{}%2Fphoto.png", addr)),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    assert_eq!(body, "PNGBYTES");
}

#[tokio::test]
async fn test_stored_image_roundtrip() {
    let state = test_state();
    let key = state.images.as_ref().unwrap().put(
        "https://cdn.example.com/x.png",
        Bytes::from_static(b"IMG"),
        "image/png",
    );
    let (resp, body) = call(&state, get(&format!("/r2img/{}", key))).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(body, "IMG");

    let (resp, _) = call(&state, get("/r2img/nope")).await;
    assert_eq!(resp.status(), 404);
}

// ---------------------------------------------------------------------------
// SSE stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stream_convert_emits_done() {
    let addr = spawn_upstream(HashMap::from([(
        "/s".to_string(),
        (
            200,
            "text/html",
            "<article><h1>Streamed</h1><p>stream body text</p></article>".to_string(),
        ),
    )]))
    .await;

    let state = test_state();
    let request = get(&format!("/api/stream?url=http%3A%2F%2F{}%2Fs", addr));
    let response = handle_request(request, state.clone(), peer()).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let collected = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("event: start"));
    assert!(text.contains("event: done"));
    assert!(text.contains("Streamed"));
}

#[tokio::test]
async fn test_stream_convert_emits_fail() {
    let state = test_state();
    let request = get("/api/stream?url=ftp%3A%2F%2Fbad");
    let response = handle_request(request, state.clone(), peer()).await.unwrap();
    let collected = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("event: fail"));
}

// ---------------------------------------------------------------------------
// Structured extraction endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_extract_endpoint_inline_html() {
    let state = test_state();
    let payload = serde_json::json!({
        "html": "<div class=\"row\"><span class=\"k\">alpha</span></div><div class=\"row\"><span class=\"k\">beta</span></div>",
        "strategy": "css",
        "schema": {
            "baseSelector": "div.row",
            "fields": [{"name": "key", "selector": "span.k", "type": "text"}]
        }
    });
    let (resp, body) = call(&state, post_json("/api/extract", Some("test-token"), payload)).await;
    assert_eq!(resp.status(), 200, "body: {}", body);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    let rows = parsed["result"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["key"], "alpha");
    assert_eq!(rows[1]["key"], "beta");
}

#[tokio::test]
async fn test_extract_endpoint_fetches_url() {
    let addr = spawn_upstream(HashMap::from([(
        "/list".to_string(),
        (
            200,
            "text/html",
            r#"<ul><li class="item">one</li><li class="item">two</li></ul>"#.to_string(),
        ),
    )]))
    .await;

    let state = test_state();
    let payload = serde_json::json!({
        "url": format!("http://{}/list", addr),
        "strategy": "regex",
        "schema": {"patterns": {"items": "class=\"item\">([a-z]+)<"}}
    });
    let (resp, body) = call(&state, post_json("/api/extract", Some("test-token"), payload)).await;
    assert_eq!(resp.status(), 200, "body: {}", body);
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["result"]["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_extract_endpoint_rejects_bad_strategy() {
    let state = test_state();
    let payload = serde_json::json!({
        "html": "<p>x</p>",
        "strategy": "jsonpath",
        "schema": {}
    });
    let (resp, _) = call(&state, post_json("/api/extract", Some("test-token"), payload)).await;
    assert_eq!(resp.status(), 400);
}
