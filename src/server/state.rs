use crate::adapters::AdapterRegistry;
use crate::browser::{BrowserEngine, RenderGate};
use crate::config::GatewayConfig;
use crate::metrics::{Metrics, RuntimeStats};
use crate::paywall::PaywallRules;
use crate::proxy::ProxyConfig;
use crate::retry_token::RetryTokenStore;
use crate::store::{
    CheckpointStore, ConversionCache, ImageStore, MemoryCache, MemoryCheckpointStore,
    MemoryImageStore,
};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Read-mostly tables (config, paywall rules) sit behind `ArcSwap` so rule
/// replacement is an atomic whole-map swap; keyed mutable stores (cache,
/// retry tokens) serialize their own writes. Storage backends and the
/// browser engine are optional collaborators.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub paywall: Arc<ArcSwap<PaywallRules>>,
    pub adapters: Arc<AdapterRegistry>,
    pub gate: Arc<RenderGate>,
    pub retry_tokens: Arc<RetryTokenStore>,
    pub cache: Option<Arc<dyn ConversionCache>>,
    pub images: Option<Arc<dyn ImageStore>>,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub browser: Option<Arc<dyn BrowserEngine>>,
    /// Outbound client for static fetches; every redirect hop re-validates
    /// the target against the address policy.
    pub http: reqwest::Client,
    pub stats: Arc<RuntimeStats>,
    pub metrics: Metrics,
    pub proxy: Option<ProxyConfig>,
    pub proxy_pool: Vec<ProxyConfig>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let paywall = match config.paywall_rules_json.as_deref() {
            Some(json) => {
                let rules = PaywallRules::from_json(json)
                    .map_err(|e| anyhow::anyhow!("PAYWALL_RULES_JSON: {}", e))?;
                info!("paywall: loaded {} rules from environment", rules.len());
                rules
            }
            None => PaywallRules::builtin(),
        };

        let proxy = match config.proxy_url.as_deref() {
            Some(raw) => Some(
                ProxyConfig::parse(raw).map_err(|e| anyhow::anyhow!("PROXY_URL: {}", e))?,
            ),
            None => None,
        };
        let proxy_pool = config
            .proxy_pool
            .as_deref()
            .map(crate::proxy::parse_pool)
            .unwrap_or_default();
        if !proxy_pool.is_empty() {
            info!("proxy: pool loaded, size={}", proxy_pool.len());
        }

        let gate = RenderGate::new(
            config.browser.max_concurrent,
            Duration::from_millis(config.browser.queue_timeout_ms),
            config.browser.max_queue_length,
        );

        let allow_private = config.fetch.allow_private_networks;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() > 10 {
                    return attempt.error("too many redirects");
                }
                match crate::safety::validate_url_policy(attempt.url(), allow_private) {
                    Ok(()) => attempt.follow(),
                    Err(e) => attempt.error(e.to_string()),
                }
            }))
            .build()?;

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            paywall: Arc::new(ArcSwap::new(Arc::new(paywall))),
            adapters: Arc::new(AdapterRegistry::new()),
            gate: Arc::new(gate),
            retry_tokens: Arc::new(RetryTokenStore::new()),
            cache: Some(Arc::new(MemoryCache::new())),
            images: Some(Arc::new(MemoryImageStore::new())),
            checkpoints: Some(Arc::new(MemoryCheckpointStore::new())),
            browser: None,
            http,
            stats: Arc::new(RuntimeStats::new()),
            metrics: Metrics::install(),
            proxy,
            proxy_pool,
        })
    }

    /// Replace the paywall rule table atomically. Readers observe either
    /// the old or the new map in whole.
    pub fn replace_paywall_rules(&self, json: &str) -> Result<usize, crate::error::ConvertError> {
        let rules = PaywallRules::from_json(json)?;
        let count = rules.len();
        self.paywall.store(Arc::new(rules));
        info!("paywall: rules replaced, count={}", count);
        Ok(count)
    }

    pub fn api_token(&self) -> Option<String> {
        self.config.load().api_token.clone()
    }
}
