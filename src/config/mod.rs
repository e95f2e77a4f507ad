pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the gateway starts with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    /// Environment overrides. Secrets (tokens, proxy credentials) are only
    /// ever read from the environment so they stay out of config files.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("API_TOKEN") {
            if !v.is_empty() {
                self.api_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PROXY_URL") {
            if !v.is_empty() {
                self.proxy_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PROXY_POOL") {
            if !v.is_empty() {
                self.proxy_pool = Some(v);
            }
        }
        if let Ok(v) = std::env::var("PAYWALL_RULES_JSON") {
            if !v.is_empty() {
                self.paywall_rules_json = Some(v);
            }
        }

        if let Ok(v) = std::env::var("MDGATE_BROWSER_MAX_CONCURRENT") {
            if let Ok(n) = v.parse::<usize>() {
                self.browser.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("MDGATE_BROWSER_QUEUE_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.browser.queue_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MDGATE_CACHE_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.cache.default_ttl_secs = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.browser.max_concurrent == 0 {
            anyhow::bail!("browser.max_concurrent must be >= 1");
        }
        if self.browser.queue_timeout_ms == 0 {
            anyhow::bail!("browser.queue_timeout_ms must be >= 1");
        }
        if self.batch.concurrency == 0 {
            anyhow::bail!("batch.concurrency must be >= 1");
        }
        if let Some(ref raw) = self.proxy_url {
            crate::proxy::ProxyConfig::parse(raw)
                .map_err(|e| anyhow::anyhow!("invalid PROXY_URL: {}", e))?;
        }
        if let Some(ref raw) = self.proxy_pool {
            let pool = crate::proxy::parse_pool(raw);
            if pool.is_empty() {
                anyhow::bail!("PROXY_POOL set but contains no valid proxies");
            }
        }
        if let Some(ref json) = self.paywall_rules_json {
            crate::paywall::PaywallRules::from_json(json)
                .map_err(|e| anyhow::anyhow!("invalid PAYWALL_RULES_JSON: {}", e))?;
        }
        Ok(())
    }
}
