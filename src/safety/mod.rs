use crate::error::ConvertError;
use ipnetwork::{Ipv4Network, Ipv6Network};
use std::net::IpAddr;
use std::sync::OnceLock;
use url::Url;

/// Maximum accepted URL length. Longer inputs are rejected before parsing.
pub const MAX_URL_LEN: usize = 4096;

/// IPv4 ranges that must never be fetched: RFC1918, loopback, link-local,
/// CGNAT, "this network" and broadcast.
const BLOCKED_V4: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "100.64.0.0/10",
    "0.0.0.0/8",
    "255.255.255.255/32",
];

/// IPv6 ranges that must never be fetched: loopback, link-local, unique-local,
/// unspecified, and v4-mapped (re-checked against the v4 table).
const BLOCKED_V6: &[&str] = &["::1/128", "fe80::/10", "fc00::/7", "::/128"];

fn blocked_v4_networks() -> &'static Vec<Ipv4Network> {
    static NETS: OnceLock<Vec<Ipv4Network>> = OnceLock::new();
    NETS.get_or_init(|| {
        BLOCKED_V4
            .iter()
            .map(|cidr| cidr.parse().expect("static CIDR table"))
            .collect()
    })
}

fn blocked_v6_networks() -> &'static Vec<Ipv6Network> {
    static NETS: OnceLock<Vec<Ipv6Network>> = OnceLock::new();
    NETS.get_or_init(|| {
        BLOCKED_V6
            .iter()
            .map(|cidr| cidr.parse().expect("static CIDR table"))
            .collect()
    })
}

/// Whether an already-resolved address falls inside a blocked range.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => blocked_v4_networks().iter().any(|n| n.contains(*v4)),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return blocked_v4_networks().iter().any(|n| n.contains(mapped));
            }
            blocked_v6_networks().iter().any(|n| n.contains(*v6))
        }
    }
}

/// Hostnames that resolve locally without touching DNS.
fn is_blocked_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host.eq_ignore_ascii_case("localhost")
        || host.to_ascii_lowercase().ends_with(".localhost")
        || host.eq_ignore_ascii_case("metadata.google.internal")
}

/// Validate and normalize a caller-supplied URL.
///
/// Accepts only absolute http(s) URLs with a hostname; rejects oversized
/// input, embedded whitespace, and IP literals inside private, loopback,
/// link-local or CGNAT ranges. Scheme-less input gets `https://` prepended
/// before parsing.
pub fn normalize_url(raw: &str) -> Result<Url, ConvertError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConvertError::InvalidUrl("empty url".into()));
    }
    if raw.len() > MAX_URL_LEN {
        return Err(ConvertError::InvalidUrl(format!(
            "url exceeds {} bytes",
            MAX_URL_LEN
        )));
    }
    if raw.chars().any(|c| c.is_whitespace()) {
        return Err(ConvertError::InvalidUrl("url contains whitespace".into()));
    }

    let candidate = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if raw.contains("://") {
        // Some other scheme — let the scheme check below produce the error.
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| ConvertError::InvalidUrl(format!("parse error: {}", e)))?;

    validate_url(&url)?;
    Ok(url)
}

/// Re-validate an absolute URL (used for redirect targets and transformed
/// URLs, which bypass `normalize_url`).
pub fn validate_url(url: &Url) -> Result<(), ConvertError> {
    validate_url_policy(url, false)
}

/// Policy-aware validation. `allow_private` skips the address-range checks
/// (local development against private networks) but keeps scheme and host
/// requirements.
pub fn validate_url_policy(url: &Url, allow_private: bool) -> Result<(), ConvertError> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConvertError::InvalidUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| ConvertError::InvalidUrl("url has no host".into()))?;

    if allow_private {
        return Ok(());
    }

    if is_blocked_hostname(host) {
        return Err(ConvertError::Blocked(format!(
            "host {} resolves to a private address",
            host
        )));
    }

    // IP literals (including bracketed IPv6) are checked against the range
    // tables. Hostnames are not resolved here; the fetch layer re-checks
    // redirect targets through this same function.
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        if is_blocked_ip(&ip) {
            return Err(ConvertError::Blocked(format!(
                "address {} is in a blocked range",
                ip
            )));
        }
    }

    Ok(())
}

/// Convenience predicate over `validate_url`.
pub fn is_safe_url(url: &Url) -> bool {
    validate_url(url).is_ok()
}

/// Escape text for embedding into HTML/SVG output.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Multi-label public suffixes where the registerable domain is three labels
/// deep (`example.co.uk`) instead of two (`example.com`).
const TWO_PART_TLDS: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "me.uk", "net.uk", "com.au", "net.au", "org.au",
    "com.cn", "net.cn", "org.cn", "gov.cn", "com.br", "com.mx", "co.jp", "ne.jp", "or.jp",
    "co.kr", "co.nz", "co.in", "co.za", "com.sg", "com.hk", "com.tw", "com.tr",
];

/// TLD-aware registerable domain of a hostname: `news.example.co.uk` →
/// `example.co.uk`, `a.b.example.com` → `example.com`. IP literals and
/// single-label hosts are returned unchanged.
pub fn registerable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    let last_two = labels[labels.len() - 2..].join(".");
    let take = if TWO_PART_TLDS.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    if labels.len() <= take {
        return host;
    }
    labels[labels.len() - take..].join(".")
}
