use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Marker embedded in adapter error messages to signal a proxied retry.
/// The token is opaque; cookies stay inside the store and never reach logs.
pub const RETRY_TOKEN_PREFIX: &str = "PROXY_RETRY_TOKEN:";

/// Legacy in-band form that carried the raw cookie string in the message.
/// Parsed for backward compatibility, always redacted before logging.
pub const LEGACY_RETRY_PREFIX: &str = "PROXY_RETRY:";

const TOKEN_TTL: Duration = Duration::from_secs(120);
const MAX_ENTRIES: usize = 256;

/// A cookie captured from a rendered page.
#[derive(Debug, Clone, Deserialize)]
pub struct CapturedCookie {
    pub name: String,
    pub value: String,
}

struct TokenEntry {
    cookie_header: String,
    created_at: Instant,
    expires_at: Instant,
}

/// Bounded TTL store mapping opaque tokens to cookie headers for
/// second-chance proxied retries. Single-item writes behind a mutex;
/// expired entries are pruned on every mutating call.
#[derive(Default)]
pub struct RetryTokenStore {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl RetryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize captured cookies into a single `Cookie` header value, store
    /// it under a fresh token, and return the in-band marker for the adapter
    /// to embed in its error message.
    pub async fn create_retry_signal(&self, cookies: &[CapturedCookie]) -> String {
        let cookie_header = cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");

        let token = Uuid::new_v4().to_string();
        let now = Instant::now();

        let mut entries = self.entries.lock().await;
        prune(&mut entries, now);
        if entries.len() >= MAX_ENTRIES {
            evict_oldest(&mut entries);
        }
        entries.insert(
            token.clone(),
            TokenEntry {
                cookie_header,
                created_at: now,
                expires_at: now + TOKEN_TTL,
            },
        );

        format!("{}{}", RETRY_TOKEN_PREFIX, token)
    }

    /// Return the cookie header for `token` exactly once (delete-on-read).
    pub async fn consume_cookies(&self, token: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        prune(&mut entries, now);
        entries.remove(token).map(|e| e.cookie_header)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

fn prune(entries: &mut HashMap<String, TokenEntry>, now: Instant) {
    entries.retain(|_, e| e.expires_at > now);
}

fn evict_oldest(entries: &mut HashMap<String, TokenEntry>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, e)| e.created_at)
        .map(|(k, _)| k.clone())
    {
        entries.remove(&oldest);
    }
}

/// Extract the opaque token from an error message carrying the marker.
pub fn extract_token(message: &str) -> Option<&str> {
    let start = message.find(RETRY_TOKEN_PREFIX)? + RETRY_TOKEN_PREFIX.len();
    let rest = &message[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_hexdigit() || c == '-'))
        .unwrap_or(rest.len());
    let token = &rest[..end];
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Extract cookies from the legacy in-band marker (`PROXY_RETRY:cookie=val`).
pub fn extract_legacy_cookies(message: &str) -> Option<String> {
    if message.contains(RETRY_TOKEN_PREFIX) {
        return None;
    }
    let start = message.find(LEGACY_RETRY_PREFIX)? + LEGACY_RETRY_PREFIX.len();
    let cookies = message[start..].trim();
    if cookies.is_empty() {
        None
    } else {
        Some(cookies.to_string())
    }
}

/// Redact any legacy in-band cookie payload before a message reaches logs
/// or clients. Token markers carry no secrets and are left intact.
pub fn redact(message: &str) -> String {
    if message.contains(RETRY_TOKEN_PREFIX) {
        return message.to_string();
    }
    match message.find(LEGACY_RETRY_PREFIX) {
        Some(pos) => format!(
            "{}{}<redacted>",
            &message[..pos],
            LEGACY_RETRY_PREFIX
        ),
        None => message.to_string(),
    }
}
