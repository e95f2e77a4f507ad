mod frontier;

pub use frontier::{CrawlStrategy, Frontier, FrontierEntry};

use crate::convert::{convert, ConvertRequest, OutputFormat};
use crate::error::ConvertError;
use crate::retry_token;
use crate::safety::registerable_domain;
use crate::server::GatewayState;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

pub const CHECKPOINT_PREFIX: &str = "deepcrawl:v1:";

pub const MAX_CRAWL_DEPTH: u32 = 6;
pub const MAX_CRAWL_PAGES: u32 = 200;
const MAX_FILTER_ENTRY_LEN: usize = 512;

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlRequest {
    pub seed: String,

    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    #[serde(default)]
    pub strategy: CrawlStrategy,

    #[serde(default)]
    pub filters: CrawlFilters,

    #[serde(default)]
    pub scorer: CrawlScorer,

    #[serde(default)]
    pub output: CrawlOutput,

    #[serde(default)]
    pub checkpoint: CrawlCheckpoint,

    #[serde(default)]
    pub stream: bool,
}

fn default_max_depth() -> u32 {
    2
}

fn default_max_pages() -> u32 {
    20
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlFilters {
    #[serde(default)]
    pub allow_domains: Vec<String>,
    #[serde(default)]
    pub deny_domains: Vec<String>,
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlScorer {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub score_threshold: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Default for CrawlScorer {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            weight: default_weight(),
            score_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlOutput {
    #[serde(default)]
    pub include_markdown: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlCheckpoint {
    #[serde(default)]
    pub crawl_id: Option<String>,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub snapshot_interval: Option<u32>,
}

fn crawl_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*$").unwrap())
}

impl CrawlRequest {
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.seed.trim().is_empty() {
            return Err(ConvertError::InvalidRequest("seed is required".into()));
        }
        if self.max_depth > MAX_CRAWL_DEPTH {
            return Err(ConvertError::InvalidRequest(format!(
                "max_depth must be 0-{}",
                MAX_CRAWL_DEPTH
            )));
        }
        if self.max_pages == 0 || self.max_pages > MAX_CRAWL_PAGES {
            return Err(ConvertError::InvalidRequest(format!(
                "max_pages must be 1-{}",
                MAX_CRAWL_PAGES
            )));
        }

        let filter_lists = [
            &self.filters.allow_domains,
            &self.filters.deny_domains,
            &self.filters.allow_paths,
            &self.filters.deny_paths,
        ];
        for list in filter_lists {
            for entry in list.iter() {
                if entry.len() > MAX_FILTER_ENTRY_LEN {
                    return Err(ConvertError::InvalidRequest(format!(
                        "filter entry exceeds {} chars",
                        MAX_FILTER_ENTRY_LEN
                    )));
                }
            }
        }
        for domain in self
            .filters
            .allow_domains
            .iter()
            .chain(self.filters.deny_domains.iter())
        {
            if !domain_re().is_match(domain) {
                return Err(ConvertError::InvalidRequest(format!(
                    "invalid domain filter: {:?}",
                    domain
                )));
            }
        }

        if let Some(ref id) = self.checkpoint.crawl_id {
            if !crawl_id_re().is_match(id) {
                return Err(ConvertError::InvalidRequest(
                    "crawl_id may only contain [A-Za-z0-9_-]".into(),
                ));
            }
        }
        if self.checkpoint.resume && self.checkpoint.crawl_id.is_none() {
            return Err(ConvertError::InvalidRequest(
                "resume=true requires crawl_id".into(),
            ));
        }
        if let Some(interval) = self.checkpoint.snapshot_interval {
            if interval == 0 {
                return Err(ConvertError::InvalidRequest(
                    "snapshot_interval must be >= 1".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    #[serde(rename = "crawledPages")]
    pub crawled_pages: u32,
    #[serde(rename = "succeededPages")]
    pub succeeded_pages: u32,
    #[serde(rename = "failedPages")]
    pub failed_pages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlNode {
    pub url: String,
    pub depth: u32,
    pub score: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CrawlSummary {
    #[serde(skip_serializing_if = "Option::is_none", rename = "crawlId")]
    pub crawl_id: Option<String>,
    pub stats: CrawlStats,
    pub resumed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    pub results: Vec<CrawlNode>,
}

/// A streaming progress event: `start`, `node`, or `done`.
#[derive(Debug, Clone)]
pub struct CrawlEvent {
    pub name: &'static str,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct CheckpointState {
    seed: String,
    visited: Vec<String>,
    frontier: Vec<FrontierEntry>,
    stats: CrawlStats,
    nodes: Vec<CrawlNode>,
}

struct ExtractedLink {
    url: Url,
    anchor_text: String,
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap()
    })
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap())
}

fn strip_tags(html: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());
    re.replace_all(html, " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collect absolute http(s) links (fragment-stripped, de-duplicated) from
/// anchor tags and bare hrefs, preserving anchor text for scoring.
fn extract_links(base: &Url, htmls: &[&str]) -> Vec<ExtractedLink> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    let mut add = |href: &str, text: String| {
        let Ok(mut resolved) = base.join(href) else {
            return;
        };
        resolved.set_fragment(None);
        if !matches!(resolved.scheme(), "http" | "https") {
            return;
        }
        if seen.insert(resolved.to_string()) {
            links.push(ExtractedLink {
                url: resolved,
                anchor_text: text,
            });
        }
    };

    for html in htmls {
        for cap in anchor_re().captures_iter(html) {
            add(&cap[1], strip_tags(&cap[2]));
        }
        // Bare hrefs (link tags, framework routers) carry no anchor text.
        for cap in href_re().captures_iter(html) {
            add(&cap[1], String::new());
        }
    }
    links
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// Keyword score: occurrences in anchor text and URL path, times weight.
fn score_link(link: &ExtractedLink, scorer: &CrawlScorer) -> f64 {
    if scorer.keywords.is_empty() {
        return 0.0;
    }
    let text = link.anchor_text.to_lowercase();
    let path = link.url.path().to_lowercase();
    let mut hits = 0usize;
    for keyword in &scorer.keywords {
        let kw = keyword.to_lowercase();
        hits += count_occurrences(&text, &kw);
        hits += count_occurrences(&path, &kw);
    }
    hits as f64 * scorer.weight
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Allow/deny filtering. Without explicit `allow_domains` the crawl stays
/// on the seed's registerable domain.
fn passes_filters(url: &Url, filters: &CrawlFilters, seed_domain: &str) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    if filters.deny_domains.iter().any(|d| domain_matches(&host, d)) {
        return false;
    }
    if filters.allow_domains.is_empty() {
        if registerable_domain(&host) != seed_domain {
            return false;
        }
    } else if !filters.allow_domains.iter().any(|d| domain_matches(&host, d)) {
        return false;
    }

    let path = url.path();
    if filters.deny_paths.iter().any(|p| path.starts_with(p.as_str())) {
        return false;
    }
    if !filters.allow_paths.is_empty()
        && !filters.allow_paths.iter().any(|p| path.starts_with(p.as_str()))
    {
        return false;
    }
    true
}

async fn emit(
    events: Option<&tokio::sync::mpsc::Sender<CrawlEvent>>,
    name: &'static str,
    data: serde_json::Value,
) {
    if let Some(tx) = events {
        let _ = tx.send(CrawlEvent { name, data }).await;
    }
}

/// Execute a deep crawl: pop the frontier, fetch through the conversion
/// pipeline, expand links, checkpoint on schedule, stream progress.
pub async fn run_crawl(
    state: &GatewayState,
    req: &CrawlRequest,
    events: Option<&tokio::sync::mpsc::Sender<CrawlEvent>>,
    cancel: &CancellationToken,
) -> Result<CrawlSummary, ConvertError> {
    req.validate()?;

    let seed_raw = if req.seed.contains("://") {
        req.seed.clone()
    } else {
        format!("https://{}", req.seed)
    };
    let seed_url = Url::parse(&seed_raw)
        .map_err(|e| ConvertError::InvalidRequest(format!("invalid seed: {}", e)))?;
    let seed_domain = registerable_domain(seed_url.host_str().unwrap_or_default());

    let checkpoint_key = req
        .checkpoint
        .crawl_id
        .as_ref()
        .map(|id| format!("{}{}", CHECKPOINT_PREFIX, id));

    // Restore prior state when resuming; a missing snapshot starts fresh.
    let mut visited: HashSet<String> = HashSet::new();
    let mut frontier = Frontier::new(req.strategy);
    let mut stats = CrawlStats::default();
    let mut nodes: Vec<CrawlNode> = Vec::new();
    let mut resumed = false;

    if req.checkpoint.resume {
        if let (Some(key), Some(store)) = (checkpoint_key.as_ref(), state.checkpoints.as_ref()) {
            if let Some(raw) = store.get_raw(key) {
                match serde_json::from_str::<CheckpointState>(&raw) {
                    Ok(saved) => {
                        visited = saved.visited.into_iter().collect();
                        frontier = Frontier::restore(req.strategy, saved.frontier);
                        stats = saved.stats;
                        nodes = saved.nodes;
                        resumed = true;
                        info!(
                            "crawl: resumed, id={}, visited={}, frontier={}",
                            req.checkpoint.crawl_id.as_deref().unwrap_or(""),
                            visited.len(),
                            frontier.len()
                        );
                    }
                    Err(e) => {
                        debug!("crawl: checkpoint parse failed, starting fresh, error={}", e);
                    }
                }
            }
        }
    }

    if !resumed {
        frontier.push(seed_url.to_string(), 0, 0.0);
    }

    emit(
        events,
        "start",
        json!({
            "crawlId": req.checkpoint.crawl_id,
            "seed": seed_url.to_string(),
            "maxDepth": req.max_depth,
            "maxPages": req.max_pages,
        }),
    )
    .await;

    let mut completed_since_snapshot = 0u32;
    let mut cancelled = false;

    loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        // Limits are checked before popping so unexpanded entries stay in
        // the frontier for the final checkpoint.
        if stats.succeeded_pages >= req.max_pages || visited.len() as u32 >= req.max_pages {
            break;
        }
        let Some(entry) = frontier.pop() else {
            break;
        };
        if entry.depth > req.max_depth {
            continue;
        }
        if visited.contains(&entry.url) {
            continue;
        }

        let started = Instant::now();
        let convert_req = ConvertRequest {
            url: entry.url.clone(),
            format: OutputFormat::Markdown,
            selector: None,
            force_browser: false,
            no_cache: false,
            capture_html: true,
            budget: Some(Duration::from_secs(
                state.config.load().crawl.fetch_timeout_secs,
            )),
        };
        let outcome = convert(state, convert_req, cancel).await;
        visited.insert(entry.url.clone());
        stats.crawled_pages += 1;

        let node = match outcome {
            Ok(result) => {
                stats.succeeded_pages += 1;
                metrics::counter!("mdgate_crawl_nodes_total", "outcome" => "success").increment(1);

                // Expand links from the selected content plus the raw page.
                if entry.depth < req.max_depth {
                    let content_html = result.content_html.clone().unwrap_or_default();
                    let source_html = result.source_html.clone().unwrap_or_default();
                    let node_url = Url::parse(&result.url_final)
                        .unwrap_or_else(|_| seed_url.clone());
                    for link in extract_links(&node_url, &[&content_html, &source_html]) {
                        let url_str = link.url.to_string();
                        if visited.contains(&url_str) {
                            continue;
                        }
                        if !passes_filters(&link.url, &req.filters, &seed_domain) {
                            continue;
                        }
                        let score = score_link(&link, &req.scorer);
                        if score < req.scorer.score_threshold {
                            continue;
                        }
                        frontier.push(url_str, entry.depth + 1, score);
                    }
                }

                CrawlNode {
                    url: entry.url.clone(),
                    depth: entry.depth,
                    score: entry.score,
                    success: true,
                    title: result.title,
                    markdown: req.output.include_markdown.then_some(result.content),
                    error: None,
                }
            }
            Err(e) => {
                stats.failed_pages += 1;
                metrics::counter!("mdgate_crawl_nodes_total", "outcome" => "failure").increment(1);
                CrawlNode {
                    url: entry.url.clone(),
                    depth: entry.depth,
                    score: entry.score,
                    success: false,
                    title: None,
                    markdown: None,
                    error: Some(retry_token::redact(&e.to_string())),
                }
            }
        };

        state
            .stats
            .deepcrawl
            .record(started.elapsed().as_secs_f64() * 1000.0);

        emit(events, "node", serde_json::to_value(&node).unwrap_or_default()).await;
        nodes.push(node);
        completed_since_snapshot += 1;

        if let (Some(key), Some(interval)) =
            (checkpoint_key.as_ref(), req.checkpoint.snapshot_interval)
        {
            if completed_since_snapshot >= interval {
                write_checkpoint(state, key, &seed_url, &visited, &frontier, &stats, &nodes);
                completed_since_snapshot = 0;
            }
        }
    }

    if let Some(key) = checkpoint_key.as_ref() {
        write_checkpoint(state, key, &seed_url, &visited, &frontier, &stats, &nodes);
    }

    emit(
        events,
        "done",
        json!({
            "stats": stats,
            "resumed": resumed,
            "cancelled": cancelled,
        }),
    )
    .await;

    Ok(CrawlSummary {
        crawl_id: req.checkpoint.crawl_id.clone(),
        stats,
        resumed,
        cancelled,
        results: nodes,
    })
}

fn write_checkpoint(
    state: &GatewayState,
    key: &str,
    seed: &Url,
    visited: &HashSet<String>,
    frontier: &Frontier,
    stats: &CrawlStats,
    nodes: &[CrawlNode],
) {
    let Some(store) = state.checkpoints.as_ref() else {
        return;
    };
    let snapshot = CheckpointState {
        seed: seed.to_string(),
        visited: visited.iter().cloned().collect(),
        frontier: frontier.snapshot(),
        stats: stats.clone(),
        nodes: nodes.to_vec(),
    };
    match serde_json::to_string(&snapshot) {
        Ok(raw) => {
            store.put_raw(key, raw);
            metrics::counter!("mdgate_crawl_checkpoints_total").increment(1);
        }
        Err(e) => debug!("crawl: checkpoint serialize failed, error={}", e),
    }
}
