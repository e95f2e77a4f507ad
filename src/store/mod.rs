use bytes::Bytes;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Deterministic cache key over the request identity. Conversions differing
/// in any component never collide within a TTL window.
pub fn fingerprint(url: &str, format: &str, selector: Option<&str>, force_browser: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0]);
    hasher.update(format.as_bytes());
    hasher.update([0]);
    hasher.update(selector.unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update([force_browser as u8]);
    hex::encode(hasher.finalize())
}

/// Cached conversion artifact.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content: String,
    pub method: String,
    pub title: Option<String>,
    pub url_final: String,
}

/// Conversion cache. Optional collaborator: the pipeline treats absence as
/// a permanent miss, never an error.
pub trait ConversionCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Option<CacheEntry>;
    fn put(&self, fingerprint: &str, entry: CacheEntry, ttl: Duration);
    /// Reclaim expired entries; backends with server-side TTL ignore this.
    fn prune(&self) {}
}

/// Out-of-band image persistence for in-browser captures.
pub trait ImageStore: Send + Sync {
    fn put(&self, url: &str, bytes: Bytes, mime: &str) -> String;
    fn get(&self, key: &str) -> Option<(Bytes, String)>;
}

/// Raw KV used for deep-crawl checkpoints (`deepcrawl:v1:<id>`).
pub trait CheckpointStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<String>;
    fn put_raw(&self, key: &str, value: String);
}

/// In-process cache with lazy expiry plus a periodic prune hook.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (CacheEntry, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl ConversionCache for MemoryCache {
    fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(fingerprint)?;
        let (value, expires) = entry.value();
        if *expires <= Instant::now() {
            drop(entry);
            self.entries.remove(fingerprint);
            return None;
        }
        Some(value.clone())
    }

    fn put(&self, fingerprint: &str, entry: CacheEntry, ttl: Duration) {
        self.entries
            .insert(fingerprint.to_string(), (entry, Instant::now() + ttl));
    }

    fn prune(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

/// In-process image store keyed by a short digest of the source URL.
#[derive(Default)]
pub struct MemoryImageStore {
    objects: DashMap<String, (Bytes, String)>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageStore for MemoryImageStore {
    fn put(&self, url: &str, bytes: Bytes, mime: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let key = hex::encode(&hasher.finalize()[..12]);
        self.objects.insert(key.clone(), (bytes, mime.to_string()));
        key
    }

    fn get(&self, key: &str) -> Option<(Bytes, String)> {
        self.objects.get(key).map(|e| e.value().clone())
    }
}

/// In-process checkpoint KV.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, String>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn put_raw(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: &str) -> CacheEntry {
        CacheEntry {
            content: content.to_string(),
            method: "readability+turndown".to_string(),
            title: Some("T".to_string()),
            url_final: "https://example.com/".to_string(),
        }
    }

    #[test]
    fn test_fingerprint_distinguishes_components() {
        let base = fingerprint("https://example.com/a", "markdown", None, false);
        assert_eq!(
            base,
            fingerprint("https://example.com/a", "markdown", None, false)
        );
        assert_ne!(base, fingerprint("https://example.com/b", "markdown", None, false));
        assert_ne!(base, fingerprint("https://example.com/a", "html", None, false));
        assert_ne!(
            base,
            fingerprint("https://example.com/a", "markdown", Some(".main"), false)
        );
        assert_ne!(base, fingerprint("https://example.com/a", "markdown", None, true));
        // Separator prevents field-boundary collisions.
        assert_ne!(
            fingerprint("https://a", "bmarkdown", None, false),
            fingerprint("https://ab", "markdown", None, false)
        );
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = MemoryCache::new();
        cache.put("fp", entry("one"), Duration::from_millis(20));
        assert_eq!(cache.get("fp").unwrap().content, "one");

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn test_cache_prune() {
        let cache = MemoryCache::new();
        cache.put("a", entry("a"), Duration::from_millis(10));
        cache.put("b", entry("b"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(30));
        cache.prune();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_image_store_roundtrip() {
        let store = MemoryImageStore::new();
        let key = store.put(
            "https://cdn.example.com/a.png",
            Bytes::from_static(b"\x89PNG"),
            "image/png",
        );
        let (bytes, mime) = store.get(&key).unwrap();
        assert_eq!(&bytes[..], b"\x89PNG");
        assert_eq!(mime, "image/png");
        assert!(store.get("missing").is_none());
    }
}
