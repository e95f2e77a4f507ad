use crate::adapters::SiteAdapter;
use crate::browser::{CapturedImage, PageState};
use crate::error::ConvertError;
use crate::metrics::RuntimeStats;
use crate::paywall::{self, PaywallRule};
use crate::proxy;
use crate::retry_token;
use crate::safety;
use crate::server::GatewayState;
use crate::store::{fingerprint, CacheEntry};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub const MAX_SELECTOR_LEN: usize = 256;

/// Response body cap on the static path.
const MAX_STATIC_BODY: usize = 10 * 1024 * 1024;

/// Tunable acceptance floor for a proxied retry body. Below this the page
/// is assumed to still be a login/challenge shell.
const PROXY_RETRY_MIN_BODY: usize = 1200;

/// Markers that flag a proxied body as a login shell.
const LOGIN_MARKERS: &[&str] = &["请登录", "扫码登录", "qrcode", "login-form", "passport-login"];

/// Markers of anti-bot interstitials in short static bodies.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "cf_chl_",
    "_cf_chl_opt",
    "document.location='/'",
    "__jsl_clearance",
    "checking your browser",
];

const CHALLENGE_MAX_LEN: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Markdown,
    Html,
    Text,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::Html => "html",
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "text/markdown; charset=utf-8",
            OutputFormat::Html => "text/html; charset=utf-8",
            OutputFormat::Text => "text/plain; charset=utf-8",
            OutputFormat::Json => "application/json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConvertError::InvalidFormat(format!(
                "unknown format: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub url: String,
    pub format: OutputFormat,
    pub selector: Option<String>,
    pub force_browser: bool,
    pub no_cache: bool,
    /// Keep acquired/selected HTML on the outcome (deep crawl link mining).
    pub capture_html: bool,
    /// Static-fetch deadline override (crawl uses short budgets).
    pub budget: Option<Duration>,
}

impl ConvertRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: OutputFormat::Markdown,
            selector: None,
            force_browser: false,
            no_cache: false,
            capture_html: false,
            budget: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    pub url_final: String,
    pub format: OutputFormat,
    pub content: String,
    pub title: Option<String>,
    pub method: String,
    pub cached: bool,
    pub fallbacks: Vec<&'static str>,
    pub elapsed_ms: u64,
    pub content_html: Option<String>,
    pub source_html: Option<String>,
}

/// Acquired page content, before post-processing and rendering.
struct Acquired {
    html: String,
    method: String,
    url_final: String,
    /// Set when the upstream already served Markdown.
    native_markdown: Option<String>,
    fallbacks: Vec<&'static str>,
    images: Vec<CapturedImage>,
    /// Browser-rendered or bypass-acquired content gets the short TTL.
    dynamic: bool,
}

/// Convert one URL. Stages run strictly in order: cache → adapter →
/// (direct | static | browser) → proxy retry → paywall fallbacks →
/// post-process → render → format → persist.
pub async fn convert(
    state: &GatewayState,
    req: ConvertRequest,
    cancel: &CancellationToken,
) -> Result<ConvertOutcome, ConvertError> {
    let started = Instant::now();
    let result = convert_inner(state, &req, cancel, started).await;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.stats.convert.record(elapsed_ms);
    match &result {
        Ok(outcome) => {
            metrics::counter!(
                "mdgate_conversions_total",
                "outcome" => "success",
                "method" => outcome.method.clone(),
            )
            .increment(1);
        }
        Err(e) => {
            RuntimeStats::incr(&state.stats.conversion_failures);
            metrics::counter!(
                "mdgate_conversions_total",
                "outcome" => "failure",
                "method" => "",
            )
            .increment(1);
            debug!(
                "convert: failed, url={}, kind={}, error={}",
                req.url,
                e.kind(),
                retry_token::redact(&e.to_string())
            );
        }
    }
    metrics::histogram!("mdgate_convert_duration_seconds").record(elapsed_ms / 1000.0);
    result
}

async fn convert_inner(
    state: &GatewayState,
    req: &ConvertRequest,
    cancel: &CancellationToken,
    started: Instant,
) -> Result<ConvertOutcome, ConvertError> {
    if let Some(ref selector) = req.selector {
        if selector.len() > MAX_SELECTOR_LEN {
            return Err(ConvertError::InvalidSelector(format!(
                "selector exceeds {} chars",
                MAX_SELECTOR_LEN
            )));
        }
    }

    let allow_private = state.config.load().fetch.allow_private_networks;
    let url = parse_request_url(&req.url, allow_private)?;

    RuntimeStats::incr(&state.stats.conversions_total);

    // Stage 1: cache.
    let fp = fingerprint(
        url.as_str(),
        req.format.as_str(),
        req.selector.as_deref(),
        req.force_browser,
    );
    if !req.no_cache {
        if let Some(cache) = state.cache.as_ref() {
            if let Some(entry) = cache.get(&fp) {
                metrics::counter!("mdgate_cache_events_total", "event" => "hit").increment(1);
                return Ok(ConvertOutcome {
                    url_final: entry.url_final,
                    format: req.format,
                    content: entry.content,
                    title: entry.title,
                    method: entry.method,
                    cached: true,
                    fallbacks: Vec::new(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    content_html: None,
                    source_html: None,
                });
            }
            metrics::counter!("mdgate_cache_events_total", "event" => "miss").increment(1);
        }
    }

    // Stage 2: adapter selection + URL transform.
    let adapter = state.adapters.get(&url);
    let working_url = match adapter.transform_url(&url) {
        Some(transformed) => {
            safety::validate_url_policy(&transformed, allow_private)?;
            debug!(
                "convert: adapter {} transformed url, from={}, to={}",
                adapter.name(),
                url,
                transformed
            );
            transformed
        }
        None => url.clone(),
    };

    // Stages 3-7: acquisition.
    let acquired = acquire(state, req, &adapter, &working_url, cancel).await?;

    // Stage 8-9: post-process + render.
    let (rendered, method) = match acquired.native_markdown {
        Some(markdown) => (
            crate::convert::render::Rendered {
                markdown,
                title: None,
                content_html: String::new(),
            },
            "native".to_string(),
        ),
        None => {
            let mut html = adapter.post_process(acquired.html.clone());
            html = paywall::remove_paywall_elements(&html);
            let rendered = crate::convert::render::html_to_markdown(&html, req.selector.as_deref())?;
            (rendered, acquired.method.clone())
        }
    };

    let mut markdown = rendered.markdown;

    // Persist in-browser captures and point the markdown at /r2img/.
    if !acquired.images.is_empty() {
        if let Some(images) = state.images.as_ref() {
            for captured in &acquired.images {
                let key = images.put(
                    &captured.url,
                    bytes::Bytes::from(captured.bytes.clone()),
                    &captured.mime,
                );
                markdown = markdown.replace(&captured.url, &format!("/r2img/{}", key));
            }
        }
    }
    if adapter.rewrite_images() {
        markdown = crate::convert::render::rewrite_image_urls(&markdown);
    }

    // Stage 10: serialize to the requested format.
    let content = match req.format {
        OutputFormat::Markdown => markdown.clone(),
        OutputFormat::Html => format!("<pre>{}</pre>", safety::escape_html(&markdown)),
        OutputFormat::Text => crate::convert::render::markdown_to_text(&markdown),
        OutputFormat::Json => serde_json::json!({
            "url": acquired.url_final,
            "title": rendered.title,
            "markdown": markdown,
            "method": method,
        })
        .to_string(),
    };

    // Stage 11: persist.
    if let Some(cache) = state.cache.as_ref() {
        let cfg = state.config.load();
        let ttl = if acquired.dynamic {
            Duration::from_secs(cfg.cache.dynamic_ttl_secs)
        } else {
            Duration::from_secs(cfg.cache.default_ttl_secs)
        };
        cache.put(
            &fp,
            CacheEntry {
                content: content.clone(),
                method: method.clone(),
                title: rendered.title.clone(),
                url_final: acquired.url_final.clone(),
            },
            ttl,
        );
    }

    Ok(ConvertOutcome {
        url_final: acquired.url_final,
        format: req.format,
        content,
        title: rendered.title,
        method,
        cached: false,
        fallbacks: acquired.fallbacks,
        elapsed_ms: started.elapsed().as_millis() as u64,
        content_html: req.capture_html.then_some(rendered.content_html),
        source_html: req.capture_html.then_some(acquired.html),
    })
}

fn parse_request_url(raw: &str, allow_private: bool) -> Result<Url, ConvertError> {
    if allow_private {
        let raw = raw.trim();
        let candidate = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };
        let url = Url::parse(&candidate)
            .map_err(|e| ConvertError::InvalidUrl(format!("parse error: {}", e)))?;
        safety::validate_url_policy(&url, true)?;
        Ok(url)
    } else {
        safety::normalize_url(raw)
    }
}

/// Stages 3-7 of the decision graph: direct → (static | browser) →
/// proxy retry → paywall fallbacks.
async fn acquire(
    state: &GatewayState,
    req: &ConvertRequest,
    adapter: &Arc<dyn SiteAdapter>,
    url: &Url,
    cancel: &CancellationToken,
) -> Result<Acquired, ConvertError> {
    // Stage 3: adapter direct fetch; failure falls through.
    if adapter.has_fetch_direct() {
        match adapter.fetch_direct(&state.http, url).await {
            Ok(Some(html)) => {
                return Ok(Acquired {
                    html,
                    method: "adapter_direct".to_string(),
                    url_final: url.to_string(),
                    native_markdown: None,
                    fallbacks: Vec::new(),
                    images: Vec::new(),
                    dynamic: true,
                });
            }
            Ok(None) => {}
            Err(e) => {
                debug!(
                    "convert: adapter_direct failed, adapter={}, error={}",
                    adapter.name(),
                    retry_token::redact(&e.to_string())
                );
            }
        }
    }

    let rule = state.paywall.load().get(url);

    // Stage 4: browser-required path.
    if adapter.always_browser() || req.force_browser {
        return browser_acquire(state, adapter, url, None, cancel).await;
    }

    // Stage 5: static path.
    match static_fetch(state, url, rule.as_deref(), req.budget, cancel).await? {
        StaticOutcome::Native { markdown, url_final } => Ok(Acquired {
            html: String::new(),
            method: "native".to_string(),
            url_final,
            native_markdown: Some(markdown),
            fallbacks: Vec::new(),
            images: Vec::new(),
            dynamic: false,
        }),
        StaticOutcome::Html { body, url_final } => {
            if is_challenge_interstitial(&body) {
                debug!("convert: challenge interstitial, falling back to browser, url={}", url);
                return browser_acquire(state, adapter, url, None, cancel).await;
            }
            if let Some(rule) = rule.as_deref() {
                if paywall::looks_paywalled(&body) {
                    if let Some(acquired) =
                        paywall_fallbacks(state, url, rule, Some(&body), req, cancel).await
                    {
                        return Ok(acquired);
                    }
                }
            }
            Ok(Acquired {
                html: body,
                method: "readability+turndown".to_string(),
                url_final,
                native_markdown: None,
                fallbacks: Vec::new(),
                images: Vec::new(),
                dynamic: false,
            })
        }
        StaticOutcome::HttpError { status, body } => {
            if let Some(rule) = rule.as_deref() {
                if let Some(acquired) =
                    paywall_fallbacks(state, url, rule, body.as_deref(), req, cancel).await
                {
                    return Ok(acquired);
                }
            }
            Err(ConvertError::FetchFailed(format!(
                "upstream returned Status: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )))
        }
    }
}

enum StaticOutcome {
    Native { markdown: String, url_final: String },
    Html { body: String, url_final: String },
    HttpError {
        status: http::StatusCode,
        body: Option<String>,
    },
}

async fn static_fetch(
    state: &GatewayState,
    url: &Url,
    rule: Option<&PaywallRule>,
    budget: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<StaticOutcome, ConvertError> {
    let cfg = state.config.load();
    let timeout = budget.unwrap_or(Duration::from_secs(cfg.fetch.static_timeout_secs));

    let mut headers: Vec<(String, String)> = vec![
        ("User-Agent".into(), cfg.fetch.user_agent.clone()),
        (
            "Accept".into(),
            "text/html,application/xhtml+xml,text/markdown;q=0.9,text/plain;q=0.8,*/*;q=0.5"
                .into(),
        ),
        ("Accept-Language".into(), "en-US,en;q=0.9".into()),
    ];
    if let Some(rule) = rule {
        paywall::apply_headers(rule, &mut headers);
    }

    let mut request = state.http.get(url.as_str()).timeout(timeout);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let send = request.send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ConvertError::FetchFailed("aborted".into())),
        r = send => r.map_err(|e| {
            if e.is_timeout() {
                ConvertError::FetchTimeout(format!("static fetch timed out after {:?}", timeout))
            } else if e.is_redirect() {
                ConvertError::Blocked(format!("redirect rejected: {}", e))
            } else {
                ConvertError::FetchFailed(e.to_string())
            }
        })?,
    };

    let status = response.status();
    let url_final = response.url().to_string();
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    let body_bytes = tokio::select! {
        _ = cancel.cancelled() => return Err(ConvertError::FetchFailed("aborted".into())),
        b = response.bytes() => b.map_err(|e| ConvertError::FetchFailed(e.to_string()))?,
    };
    if body_bytes.len() > MAX_STATIC_BODY {
        return Err(ConvertError::FetchFailed(format!(
            "response exceeds {} bytes",
            MAX_STATIC_BODY
        )));
    }
    let body = String::from_utf8_lossy(&body_bytes).into_owned();

    if !status.is_success() {
        return Ok(StaticOutcome::HttpError {
            status,
            body: (!body.is_empty()).then_some(body),
        });
    }

    let ct_base = content_type.split(';').next().unwrap_or("").trim();
    match ct_base {
        "text/markdown" => Ok(StaticOutcome::Native {
            markdown: body,
            url_final,
        }),
        "text/html" | "application/xhtml+xml" | "text/plain" | "" => Ok(StaticOutcome::Html {
            body,
            url_final,
        }),
        other => Err(ConvertError::UnsupportedContent(other.to_string())),
    }
}

fn is_challenge_interstitial(body: &str) -> bool {
    if body.len() > CHALLENGE_MAX_LEN {
        return false;
    }
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Stage 4: gate-scheduled browser render, with in-band proxy-retry
/// handling. `cookie_header` is set on second-chance renders.
async fn browser_acquire(
    state: &GatewayState,
    adapter: &Arc<dyn SiteAdapter>,
    url: &Url,
    cookie_header: Option<String>,
    cancel: &CancellationToken,
) -> Result<Acquired, ConvertError> {
    let Some(engine) = state.browser.clone() else {
        return Err(ConvertError::FetchFailed(
            "browser rendering required but no engine is configured".into(),
        ));
    };

    let cfg = state.config.load();
    let nav_timeout = adapter
        .nav_timeout()
        .unwrap_or(Duration::from_secs(cfg.browser.nav_timeout_secs));
    let label = url.host_str().unwrap_or("page").to_string();

    let render = state.gate.run(&label, cancel, async {
        let page = engine.new_page().await?;
        let mut page_state = PageState::new(state.retry_tokens.clone());
        page_state.cookie_header = cookie_header.clone();

        let outcome = async {
            adapter.configure_page(page.as_ref(), &mut page_state).await?;
            page.navigate(url.as_str(), nav_timeout).await?;
            match adapter.extract(page.as_ref(), &mut page_state).await? {
                Some(extracted) => Ok((extracted.html, extracted.images)),
                None => Ok((page.content().await?, Vec::new())),
            }
        }
        .await;

        let _ = page.close().await;
        outcome
    });

    match render.await {
        Ok((html, images)) => Ok(Acquired {
            html,
            method: "browser+readability+turndown".to_string(),
            url_final: url.to_string(),
            native_markdown: None,
            fallbacks: Vec::new(),
            images,
            dynamic: true,
        }),
        Err(e) => {
            let message = e.to_string();
            // In-band retry signal: token form first, then the legacy form
            // (which is redacted everywhere it could be logged).
            let cookies = if let Some(token) = retry_token::extract_token(&message) {
                state.retry_tokens.consume_cookies(token).await
            } else {
                retry_token::extract_legacy_cookies(&message)
            };
            match cookies {
                Some(cookie_header) => proxy_retry(state, url, &cookie_header, cancel).await,
                None => Err(e),
            }
        }
    }
}

/// Stage 6: second-chance fetch through the forward proxy with the cookies
/// captured in-browser.
async fn proxy_retry(
    state: &GatewayState,
    url: &Url,
    cookie_header: &str,
    cancel: &CancellationToken,
) -> Result<Acquired, ConvertError> {
    let cfg = state.config.load();
    let timeout = Duration::from_secs(cfg.fetch.proxy_timeout_secs);
    let headers: Vec<(String, String)> = vec![
        ("User-Agent".into(), cfg.fetch.user_agent.clone()),
        ("Cookie".into(), cookie_header.to_string()),
        ("Accept".into(), "text/html,application/xhtml+xml".into()),
    ];

    metrics::counter!("mdgate_proxy_fetch_total").increment(1);

    if !state.proxy_pool.is_empty() {
        let accept = |resp: &proxy::ProxyResponse| {
            (200..400).contains(&resp.status) && proxy_body_acceptable(&resp.body_string())
        };
        let outcome = proxy::fetch_via_proxy_pool(
            &state.proxy_pool,
            proxy::DEFAULT_VARIANTS,
            url,
            &headers,
            Some(&accept),
            timeout,
            cancel,
        )
        .await?;
        return Ok(Acquired {
            html: outcome.response.body_string(),
            method: format!("proxy_pool_{}_{}", outcome.proxy_index, outcome.variant),
            url_final: url.to_string(),
            native_markdown: None,
            fallbacks: Vec::new(),
            images: Vec::new(),
            dynamic: true,
        });
    }

    let Some(proxy_cfg) = state.proxy.as_ref() else {
        return Err(ConvertError::FetchFailed(
            "proxied retry requested: configure PROXY_URL".into(),
        ));
    };

    let response = proxy::fetch_via_proxy(proxy_cfg, url, &headers, timeout, cancel).await?;
    let body = response.body_string();
    if !(200..400).contains(&response.status) || !proxy_body_acceptable(&body) {
        return Err(ConvertError::FetchFailed(format!(
            "proxied retry rejected, Status: {} body_len={}",
            response.status,
            body.len()
        )));
    }
    Ok(Acquired {
        html: body,
        method: "proxy".to_string(),
        url_final: url.to_string(),
        native_markdown: None,
        fallbacks: Vec::new(),
        images: Vec::new(),
        dynamic: true,
    })
}

fn proxy_body_acceptable(body: &str) -> bool {
    if body.len() <= PROXY_RETRY_MIN_BODY {
        return false;
    }
    let lower = body.to_lowercase();
    !LOGIN_MARKERS.iter().any(|m| lower.contains(m))
}

/// Stage 7: paywall fallback chain. Candidates run in order (JSON-LD →
/// AMP → Wayback → archive.today); the longest resulting Markdown wins.
async fn paywall_fallbacks(
    state: &GatewayState,
    url: &Url,
    rule: &PaywallRule,
    paywalled_body: Option<&str>,
    req: &ConvertRequest,
    cancel: &CancellationToken,
) -> Option<Acquired> {
    let cfg = state.config.load();
    let index_timeout = Duration::from_secs(cfg.fetch.archive_index_timeout_secs);
    let body_timeout = Duration::from_secs(cfg.fetch.archive_body_timeout_secs);

    let mut attempted: Vec<&'static str> = Vec::new();
    let mut best: Option<(usize, String, &'static str)> = None;

    let mut consider = |html: String, tag: &'static str, best: &mut Option<(usize, String, &'static str)>| {
        let len = crate::convert::render::html_to_markdown(&html, req.selector.as_deref())
            .map(|r| r.markdown.len())
            .unwrap_or(0);
        let better = best.as_ref().map(|(l, _, _)| len > *l).unwrap_or(len > 0);
        if better {
            *best = Some((len, html, tag));
        }
    };

    // (a) JSON-LD from the already-fetched body.
    if rule.json_ld {
        if let Some(body) = paywalled_body {
            attempted.push("jsonld");
            metrics::counter!("mdgate_paywall_fallback_total", "stage" => "jsonld").increment(1);
            if let Some(article) = paywall::extract_json_ld_article(body) {
                consider(article, "jsonld", &mut best);
            }
        }
    }

    // (b) AMP variant with access controls stripped.
    if let Some(body) = paywalled_body {
        if let Some(amp_href) = paywall::extract_amp_link(body) {
            if let Ok(amp_url) = url.join(&amp_href) {
                let allow_private = cfg.fetch.allow_private_networks;
                if safety::validate_url_policy(&amp_url, allow_private).is_ok() {
                    attempted.push("amp");
                    metrics::counter!("mdgate_paywall_fallback_total", "stage" => "amp")
                        .increment(1);
                    if let Ok(StaticOutcome::Html { body: amp_body, .. }) =
                        static_fetch(state, &amp_url, Some(rule), None, cancel).await
                    {
                        consider(
                            paywall::strip_amp_access_controls(&amp_body),
                            "amp",
                            &mut best,
                        );
                    }
                }
            }
        }
    }

    // (c) Wayback Machine snapshot.
    attempted.push("wayback");
    metrics::counter!("mdgate_paywall_fallback_total", "stage" => "wayback").increment(1);
    if let Some(snapshot) = paywall::fetch_wayback_snapshot(
        &state.http,
        url.as_str(),
        index_timeout,
        body_timeout,
        cancel,
    )
    .await
    {
        consider(snapshot, "wayback", &mut best);
    }

    // (d) archive.today newest capture.
    attempted.push("archive_today");
    metrics::counter!("mdgate_paywall_fallback_total", "stage" => "archive_today").increment(1);
    if let Some(capture) =
        paywall::fetch_archive_today(&state.http, url.as_str(), body_timeout, cancel).await
    {
        consider(capture, "archive_today", &mut best);
    }

    match best {
        Some((_, html, tag)) => {
            warn!("convert: paywall fallback succeeded, url={}, via={}", url, tag);
            Some(Acquired {
                html,
                method: tag.to_string(),
                url_final: url.to_string(),
                native_markdown: None,
                fallbacks: attempted,
                images: Vec::new(),
                dynamic: true,
            })
        }
        None => None,
    }
}
