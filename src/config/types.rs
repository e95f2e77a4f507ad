use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
///
/// Everything here has a working default so the gateway can start with zero
/// configuration for local development; secrets and proxy endpoints come
/// from the environment (see `GatewayConfig::apply_env_overrides`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub crawl: CrawlConfig,

    /// Bearer token protecting `/api/batch` and `/api/deepcrawl`.
    /// Env: `API_TOKEN`.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Single forward proxy, `user:pass@host:port`. Env: `PROXY_URL`.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Comma/newline separated proxy list. Env: `PROXY_POOL`.
    #[serde(default)]
    pub proxy_pool: Option<String>,

    /// JSON paywall rule table replacing the built-in defaults.
    /// Env: `PAYWALL_RULES_JSON`.
    #[serde(default)]
    pub paywall_rules_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Static (direct HTTPS) fetch deadline, seconds.
    #[serde(default = "default_static_timeout")]
    pub static_timeout_secs: u64,

    /// Forward-proxy socket deadline, seconds.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,

    /// Archive availability-index deadline, seconds.
    #[serde(default = "default_archive_index_timeout")]
    pub archive_index_timeout_secs: u64,

    /// Archive snapshot-body deadline, seconds.
    #[serde(default = "default_archive_body_timeout")]
    pub archive_body_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Permit fetches to private/loopback ranges. Only for local
    /// development; never enable in production.
    #[serde(default)]
    pub allow_private_networks: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            static_timeout_secs: default_static_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
            archive_index_timeout_secs: default_archive_index_timeout(),
            archive_body_timeout_secs: default_archive_body_timeout(),
            user_agent: default_user_agent(),
            allow_private_networks: false,
        }
    }
}

fn default_static_timeout() -> u64 {
    20
}

fn default_proxy_timeout() -> u64 {
    20
}

fn default_archive_index_timeout() -> u64 {
    5
}

fn default_archive_body_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Concurrent browser renders allowed through the gate.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long an acquirer may wait in the gate queue, milliseconds.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Queue length at which further acquirers are rejected immediately.
    #[serde(default)]
    pub max_queue_length: Option<usize>,

    /// Default navigation deadline, seconds. Adapters may override per site.
    #[serde(default = "default_nav_timeout")]
    pub nav_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_timeout_ms: default_queue_timeout_ms(),
            max_queue_length: None,
            nav_timeout_secs: default_nav_timeout(),
        }
    }
}

fn default_max_concurrent() -> usize {
    2
}

fn default_queue_timeout_ms() -> u64 {
    10_000
}

fn default_nav_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for statically fetched conversions, seconds.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// TTL for browser-rendered / dynamic conversions, seconds.
    #[serde(default = "default_dynamic_ttl")]
    pub dynamic_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            dynamic_ttl_secs: default_dynamic_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_dynamic_ttl() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrent conversion workers per batch request.
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,

    /// Retries for rate-limited items.
    #[serde(default = "default_batch_retries")]
    pub max_retries: u32,

    /// Base per-host delay, milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Per-host backoff ceiling, milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_batch_concurrency(),
            max_retries: default_batch_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_batch_concurrency() -> usize {
    3
}

fn default_batch_retries() -> u32 {
    2
}

fn default_base_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    15_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Per-node fetch deadline inside a deep crawl, seconds.
    #[serde(default = "default_crawl_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Concurrent frontier expansions.
    #[serde(default = "default_crawl_concurrency")]
    pub concurrency: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_crawl_fetch_timeout(),
            concurrency: default_crawl_concurrency(),
        }
    }
}

fn default_crawl_fetch_timeout() -> u64 {
    15
}

fn default_crawl_concurrency() -> usize {
    2
}
