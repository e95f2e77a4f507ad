use super::transport::{fetch_via_proxy, ProxyConfig, ProxyError, ProxyResponse};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const MOBILE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

const GOOGLEBOT_UA: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

/// A named header overlay applied during pool rotation. Later variants are
/// tried only after every proxy has failed with the earlier ones.
#[derive(Debug, Clone)]
pub struct HeaderVariant {
    pub name: &'static str,
    pub headers: &'static [(&'static str, &'static str)],
}

pub const DEFAULT_VARIANTS: &[HeaderVariant] = &[
    HeaderVariant {
        name: "default",
        headers: &[],
    },
    HeaderVariant {
        name: "mobile",
        headers: &[
            ("User-Agent", MOBILE_UA),
            ("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8"),
        ],
    },
    HeaderVariant {
        name: "googlebot",
        headers: &[
            ("User-Agent", GOOGLEBOT_UA),
            ("X-Forwarded-For", "66.249.66.1"),
        ],
    },
];

/// Parse a comma/newline separated proxy list, dropping entries that fail to
/// parse and de-duplicating case-insensitively on `(user, pass, host, port)`.
/// First-seen order is preserved.
pub fn parse_pool(raw: &str) -> Vec<ProxyConfig> {
    let mut seen = HashSet::new();
    let mut pool = Vec::new();
    for part in raw.split(|c| c == ',' || c == '\n') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match ProxyConfig::parse(part) {
            Ok(cfg) => {
                if seen.insert(cfg.dedupe_key()) {
                    pool.push(cfg);
                }
            }
            Err(e) => {
                debug!("proxy_pool: skipping invalid entry, error={}", e);
            }
        }
    }
    pool
}

/// Result of a successful pool fetch, carrying which `(proxy, variant)`
/// combination produced it so callers can tag the acquisition method.
#[derive(Debug)]
pub struct PoolFetchOutcome {
    pub response: ProxyResponse,
    pub proxy_index: usize,
    pub variant: &'static str,
    pub attempts: usize,
}

fn default_accept(resp: &ProxyResponse) -> bool {
    (200..400).contains(&resp.status)
}

/// Overlay variant headers onto the base set. A variant header replaces a
/// base header of the same (case-insensitive) name.
fn overlay_headers(
    base: &[(String, String)],
    variant: &HeaderVariant,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = base.to_vec();
    for (name, value) in variant.headers {
        match merged
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value.to_string(),
            None => merged.push((name.to_string(), value.to_string())),
        }
    }
    merged
}

/// Iterate `(proxy_i, variant_j)` in order until `accept` approves a
/// response. Per-attempt failures are collected; if every combination fails
/// the caller gets `PoolExhausted` with the full attempt log.
pub async fn fetch_via_proxy_pool(
    pool: &[ProxyConfig],
    variants: &[HeaderVariant],
    url: &Url,
    base_headers: &[(String, String)],
    accept: Option<&(dyn Fn(&ProxyResponse) -> bool + Sync)>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PoolFetchOutcome, ProxyError> {
    if pool.is_empty() {
        return Err(ProxyError::PoolExhausted {
            attempts: 0,
            errors: vec!["empty pool".into()],
        });
    }

    let mut attempts = 0usize;
    let mut errors = Vec::new();

    for (i, proxy) in pool.iter().enumerate() {
        for variant in variants {
            if cancel.is_cancelled() {
                return Err(ProxyError::Aborted);
            }
            attempts += 1;
            let headers = overlay_headers(base_headers, variant);
            match fetch_via_proxy(proxy, url, &headers, timeout, cancel).await {
                Ok(resp) => {
                    let accepted = match accept {
                        Some(f) => f(&resp),
                        None => default_accept(&resp),
                    };
                    if accepted {
                        debug!(
                            "proxy_pool: accepted, proxy={}, variant={}, status={}",
                            i, variant.name, resp.status
                        );
                        return Ok(PoolFetchOutcome {
                            response: resp,
                            proxy_index: i,
                            variant: variant.name,
                            attempts,
                        });
                    }
                    errors.push(format!(
                        "proxy[{}] variant={}: rejected status {}",
                        i, variant.name, resp.status
                    ));
                }
                Err(ProxyError::Aborted) => return Err(ProxyError::Aborted),
                Err(e) => {
                    errors.push(format!("proxy[{}] variant={}: {}", i, variant.name, e));
                }
            }
        }
    }

    Err(ProxyError::PoolExhausted { attempts, errors })
}
