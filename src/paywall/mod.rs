use crate::safety::{escape_html, registerable_domain};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub const GOOGLEBOT_UA: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

/// Spoofed crawler source address sent when a rule asks for it.
const GOOGLEBOT_XFF: &str = "66.249.66.1";

/// Minimum article body length for a JSON-LD candidate.
const JSONLD_MIN_BODY: usize = 200;

/// Archive snapshots shorter than this are considered stubs and discarded.
const ARCHIVE_MIN_BODY: usize = 1000;

/// Per-site bypass rule. Field names mirror the runtime-supplied JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaywallRule {
    pub domains: Vec<String>,
    #[serde(default)]
    pub googlebot: bool,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default, alias = "jsonLd")]
    pub json_ld: bool,
    #[serde(default, alias = "xForwardedFor")]
    pub x_forwarded_for: bool,
}

/// Process-wide rule table, indexed by registerable domain. Replaced as a
/// whole via `ArcSwap` in the gateway state; readers never see a partial
/// table.
#[derive(Debug, Default)]
pub struct PaywallRules {
    by_domain: HashMap<String, Vec<(String, Arc<PaywallRule>)>>,
}

impl PaywallRules {
    pub fn from_rules(rules: Vec<PaywallRule>) -> Self {
        let mut by_domain: HashMap<String, Vec<(String, Arc<PaywallRule>)>> = HashMap::new();
        for rule in rules {
            let rule = Arc::new(rule);
            for domain in &rule.domains {
                let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
                if domain.is_empty() {
                    continue;
                }
                by_domain
                    .entry(registerable_domain(&domain))
                    .or_default()
                    .push((domain, rule.clone()));
            }
        }
        Self { by_domain }
    }

    /// Parse and validate a runtime-supplied JSON rule table.
    pub fn from_json(json: &str) -> Result<Self, crate::error::ConvertError> {
        let rules: Vec<PaywallRule> = serde_json::from_str(json).map_err(|e| {
            crate::error::ConvertError::InvalidRequest(format!("invalid paywall rules: {}", e))
        })?;
        for rule in &rules {
            if rule.domains.is_empty() {
                return Err(crate::error::ConvertError::InvalidRequest(
                    "paywall rule with empty domains".into(),
                ));
            }
            for d in &rule.domains {
                if d.trim().is_empty() || d.chars().any(|c| c.is_whitespace()) {
                    return Err(crate::error::ConvertError::InvalidRequest(format!(
                        "invalid paywall domain: {:?}",
                        d
                    )));
                }
            }
        }
        Ok(Self::from_rules(rules))
    }

    /// Built-in rule table applied at process start.
    pub fn builtin() -> Self {
        let googlebot_sites = [
            "nytimes.com",
            "wsj.com",
            "ft.com",
            "economist.com",
            "bloomberg.com",
            "washingtonpost.com",
            "telegraph.co.uk",
            "theaustralian.com.au",
            "smh.com.au",
        ];
        let jsonld_sites = [
            "theatlantic.com",
            "newyorker.com",
            "wired.com",
            "businessinsider.com",
            "medium.com",
        ];

        let mut rules = Vec::new();
        for site in googlebot_sites {
            rules.push(PaywallRule {
                domains: vec![site.to_string()],
                googlebot: true,
                referer: Some("https://www.google.com/".into()),
                json_ld: true,
                x_forwarded_for: true,
            });
        }
        for site in jsonld_sites {
            rules.push(PaywallRule {
                domains: vec![site.to_string()],
                googlebot: false,
                referer: Some("https://www.google.com/".into()),
                json_ld: true,
                x_forwarded_for: false,
            });
        }
        Self::from_rules(rules)
    }

    /// Rule for a URL's host, subdomains included.
    pub fn get(&self, url: &Url) -> Option<Arc<PaywallRule>> {
        let host = url.host_str()?.to_ascii_lowercase();
        let candidates = self.by_domain.get(&registerable_domain(&host))?;
        candidates
            .iter()
            .find(|(domain, _)| host == *domain || host.ends_with(&format!(".{}", domain)))
            .map(|(_, rule)| rule.clone())
    }

    pub fn len(&self) -> usize {
        self.by_domain.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
        Some(slot) => slot.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}

/// Mutate outbound request headers per the rule: crawler UA, referer and
/// spoofed forwarding address.
pub fn apply_headers(rule: &PaywallRule, headers: &mut Vec<(String, String)>) {
    if rule.googlebot {
        set_header(headers, "User-Agent", GOOGLEBOT_UA);
    }
    if let Some(ref referer) = rule.referer {
        set_header(headers, "Referer", referer);
    }
    if rule.x_forwarded_for {
        set_header(headers, "X-Forwarded-For", GOOGLEBOT_XFF);
    }
}

const ARTICLE_TYPES: &[&str] = &[
    "Article",
    "NewsArticle",
    "ReportageNewsArticle",
    "BlogPosting",
    "LiveBlogPosting",
    "ScholarlyArticle",
    "TechArticle",
    "SocialMediaPosting",
];

fn jsonld_script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#)
            .unwrap()
    })
}

fn type_matches_article(node: &serde_json::Value) -> bool {
    match node.get("@type") {
        Some(serde_json::Value::String(t)) => ARTICLE_TYPES.contains(&t.as_str()),
        Some(serde_json::Value::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| ARTICLE_TYPES.contains(&t)),
        _ => false,
    }
}

fn collect_article_candidates<'a>(
    node: &'a serde_json::Value,
    out: &mut Vec<(&'a str, Option<&'a str>)>,
) {
    match node {
        serde_json::Value::Array(items) => {
            for item in items {
                collect_article_candidates(item, out);
            }
        }
        serde_json::Value::Object(obj) => {
            if let Some(graph) = obj.get("@graph") {
                collect_article_candidates(graph, out);
            }
            if type_matches_article(node) {
                if let Some(body) = obj.get("articleBody").and_then(|b| b.as_str()) {
                    if body.len() >= JSONLD_MIN_BODY {
                        out.push((body, obj.get("headline").and_then(|h| h.as_str())));
                    }
                }
            }
        }
        _ => {}
    }
}

/// Pull the full article body out of JSON-LD metadata. Sites frequently
/// ship the complete text to search engines even when the visible DOM is
/// truncated. Among qualifying blocks the longest body wins.
pub fn extract_json_ld_article(html: &str) -> Option<String> {
    let mut best: Option<(String, Option<String>)> = None;

    for cap in jsonld_script_re().captures_iter(html) {
        let raw = cap.get(1).map(|m| m.as_str())?;
        let parsed: serde_json::Value = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let mut candidates = Vec::new();
        collect_article_candidates(&parsed, &mut candidates);
        for (body, headline) in candidates {
            let better = best
                .as_ref()
                .map(|(b, _)| body.len() > b.len())
                .unwrap_or(true);
            if better {
                best = Some((body.to_string(), headline.map(|h| h.to_string())));
            }
        }
    }

    let (body, headline) = best?;
    let mut html_out = String::with_capacity(body.len() + 256);
    html_out.push_str("<article>");
    if let Some(h) = headline {
        html_out.push_str("<h1>");
        html_out.push_str(&escape_html(&h));
        html_out.push_str("</h1>");
    }
    for para in body.split('\n').map(str::trim).filter(|p| !p.is_empty()) {
        html_out.push_str("<p>");
        html_out.push_str(&escape_html(para));
        html_out.push_str("</p>");
    }
    html_out.push_str("</article>");
    Some(html_out)
}

const PAYWALL_PHRASES: &[&str] = &[
    "subscribe to continue",
    "subscription required",
    "to continue reading",
    "create a free account",
    "already a subscriber",
    "sign in to continue reading",
    "register to continue",
    "this article is for subscribers",
    "unlock this article",
];

fn tag_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</\1>|<[^>]+>").unwrap())
}

/// Heuristic: a page whose markup is large but whose visible text is tiny,
/// or which carries a known subscription phrase, is treated as paywalled.
pub fn looks_paywalled(html: &str) -> bool {
    let text = tag_strip_re().replace_all(html, " ");
    let text_len = text.split_whitespace().map(|w| w.len() + 1).sum::<usize>();
    if text_len < 500 && html.len() > 10_000 {
        return true;
    }
    let lower = text.to_lowercase();
    PAYWALL_PHRASES.iter().any(|p| lower.contains(p))
}

const PAYWALL_SELECTORS: &[&str] = &[
    "paywall",
    "tp-modal",
    "tp-backdrop",
    "tp-iframe-wrapper",
    "piano-modal",
    "regwall",
    "reg-gate",
    "metered-modal",
    "subscribe-overlay",
    "subscription-required",
    "gateway-content",
];

fn paywall_element_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        let mut res = Vec::new();
        for sel in PAYWALL_SELECTORS {
            // class="… sel …"  /  id="sel"  /  data-… attribute forms
            res.push(
                Regex::new(&format!(
                    r#"(?is)<(div|section|aside|p)[^>]*class\s*=\s*["'][^"']*{}[^"']*["'][^>]*>.*?</\1>"#,
                    regex::escape(sel)
                ))
                .unwrap(),
            );
            res.push(
                Regex::new(&format!(
                    r#"(?is)<(div|section|aside|p)[^>]*id\s*=\s*["']{}["'][^>]*>.*?</\1>"#,
                    regex::escape(sel)
                ))
                .unwrap(),
            );
        }
        res.push(Regex::new(r#"(?is)<[^>]+data-paywall[^>]*>.*?</[^>]+>"#).unwrap());
        res
    })
}

fn truncation_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // CSS truncation on article-body-class containers: drop the style attr.
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)(<[^>]*class\s*=\s*["'][^"']*article-body[^"']*["'][^>]*?)\s+style\s*=\s*["'][^"']*(?:max-height|overflow)\s*:[^"']*["']"#,
        )
        .unwrap()
    })
}

/// Regex-strip known paywall overlay elements and CSS truncation styles.
/// Deliberately permissive string surgery; input is already size-capped
/// upstream.
pub fn remove_paywall_elements(html: &str) -> String {
    let mut out = html.to_string();
    for re in paywall_element_res() {
        out = re.replace_all(&out, "").into_owned();
    }
    out = truncation_style_re().replace_all(&out, "$1").into_owned();
    out
}

fn amp_link_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            Regex::new(
                r#"(?is)<link[^>]*rel\s*=\s*["']amphtml["'][^>]*href\s*=\s*["']([^"']+)["']"#,
            )
            .unwrap(),
            Regex::new(
                r#"(?is)<link[^>]*href\s*=\s*["']([^"']+)["'][^>]*rel\s*=\s*["']amphtml["']"#,
            )
            .unwrap(),
        ]
    })
}

/// `<link rel="amphtml" href="…">`, either attribute order / quote style.
pub fn extract_amp_link(html: &str) -> Option<String> {
    for re in amp_link_res() {
        if let Some(cap) = re.captures(html) {
            return Some(cap[1].to_string());
        }
    }
    None
}

fn amp_access_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            Regex::new(r#"(?i)\s+subscriptions-section\s*=\s*["']content-not-granted["']"#).unwrap(),
            Regex::new(r#"(?i)\s+amp-access-hide\b"#).unwrap(),
            Regex::new(r#"(?i)\s+subscriptions-display\s*=\s*["'][^"']*["']"#).unwrap(),
        ]
    })
}

/// Remove AMP subscription gating attributes so gated sections render.
pub fn strip_amp_access_controls(html: &str) -> String {
    let mut out = html.to_string();
    for re in amp_access_res() {
        out = re.replace_all(&out, "").into_owned();
    }
    out
}

#[derive(Debug, Deserialize)]
struct WaybackAvailable {
    archived_snapshots: WaybackSnapshots,
}

#[derive(Debug, Deserialize)]
struct WaybackSnapshots {
    closest: Option<WaybackClosest>,
}

#[derive(Debug, Deserialize)]
struct WaybackClosest {
    available: bool,
    url: String,
}

/// Rewrite a wayback snapshot URL to its `id_` raw form, which serves the
/// original markup without the archive chrome.
fn wayback_raw_url(snapshot_url: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(/web/\d{14})(/)").unwrap());
    re.replace(snapshot_url, "${1}id_$2").into_owned()
}

/// Query the Wayback Machine availability index and fetch the closest
/// snapshot. Returns `None` for "no snapshot" and for stub bodies.
pub async fn fetch_wayback_snapshot(
    client: &reqwest::Client,
    url: &str,
    index_timeout: Duration,
    body_timeout: Duration,
    cancel: &CancellationToken,
) -> Option<String> {
    let index_url = format!(
        "https://archive.org/wayback/available?url={}",
        urlencode(url)
    );

    let lookup = async {
        let resp = client
            .get(&index_url)
            .timeout(index_timeout)
            .send()
            .await
            .ok()?;
        resp.json::<WaybackAvailable>().await.ok()
    };
    let available = tokio::select! {
        _ = cancel.cancelled() => return None,
        v = lookup => v?,
    };

    let closest = available.archived_snapshots.closest?;
    if !closest.available {
        return None;
    }

    let raw_url = wayback_raw_url(&closest.url);
    let fetch = async {
        let resp = client
            .get(&raw_url)
            .timeout(body_timeout)
            .send()
            .await
            .ok()?;
        resp.text().await.ok()
    };
    let body = tokio::select! {
        _ = cancel.cancelled() => return None,
        v = fetch => v?,
    };

    if body.len() > ARCHIVE_MIN_BODY {
        debug!("paywall: wayback snapshot hit, url={}, bytes={}", url, body.len());
        Some(body)
    } else {
        None
    }
}

/// Fetch the newest archive.today capture, following its redirect chain.
pub async fn fetch_archive_today(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Option<String> {
    let archive_url = format!("https://archive.today/newest/{}", urlencode(url));
    let fetch = async {
        let resp = client
            .get(&archive_url)
            .timeout(timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok()
    };
    let body = tokio::select! {
        _ = cancel.cancelled() => return None,
        v = fetch => v?,
    };
    if body.len() > ARCHIVE_MIN_BODY {
        debug!("paywall: archive.today hit, url={}, bytes={}", url, body.len());
        Some(body)
    } else {
        None
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
