mod sites;

pub use sites::*;

use crate::browser::{ExtractedPage, Page, PageState};
use crate::error::ConvertError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Per-site acquisition strategy. Every capability is optional; the default
/// implementation is a no-op so adapters only override what they need.
///
/// Capability map:
/// - `transform_url`     — rewrite before any fetch (e.g. www → old.reddit)
/// - `fetch_direct`      — API synthesis without fetching the page itself
/// - `always_browser`    — force the rendering path
/// - `configure_page`    — UA / headers / cookies before navigation
/// - `extract`           — site-specific harvest from the rendered page
/// - `post_process`      — strip chrome from acquired HTML
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, url: &Url) -> bool;

    fn always_browser(&self) -> bool {
        false
    }

    /// Per-site navigation deadline override.
    fn nav_timeout(&self) -> Option<Duration> {
        None
    }

    fn transform_url(&self, _url: &Url) -> Option<Url> {
        None
    }

    /// Whether `fetch_direct` is implemented, so the pipeline can skip the
    /// call entirely for adapters without one.
    fn has_fetch_direct(&self) -> bool {
        false
    }

    async fn fetch_direct(
        &self,
        _client: &reqwest::Client,
        _url: &Url,
    ) -> Result<Option<String>, ConvertError> {
        Ok(None)
    }

    async fn configure_page(
        &self,
        _page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<(), ConvertError> {
        Ok(())
    }

    /// Harvest content from a rendered page. `Ok(None)` means "use the
    /// page's serialized document as-is".
    async fn extract(
        &self,
        _page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<Option<ExtractedPage>, ConvertError> {
        Ok(None)
    }

    fn post_process(&self, html: String) -> String {
        html
    }

    /// Whether acquired image URLs must be proxied through `/img/`
    /// (hotlink-protected CDNs).
    fn rewrite_images(&self) -> bool {
        false
    }
}

/// Ordered adapter list; first match wins, `Generic` is the terminal
/// fallback and must stay last.
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SiteAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let adapters: Vec<Arc<dyn SiteAdapter>> = vec![
            Arc::new(WeChatAdapter),
            Arc::new(ZhihuAdapter),
            Arc::new(YuqueAdapter),
            Arc::new(NotionAdapter),
            Arc::new(JuejinAdapter),
            Arc::new(CsdnAdapter),
            Arc::new(ThirtySixKrAdapter),
            Arc::new(ToutiaoAdapter),
            Arc::new(NetEaseAdapter),
            Arc::new(WeiboAdapter),
            Arc::new(RedditAdapter),
            Arc::new(TwitterAdapter),
            Arc::new(FeishuAdapter),
            Arc::new(GenericAdapter),
        ];
        Self { adapters }
    }

    pub fn get(&self, url: &Url) -> Arc<dyn SiteAdapter> {
        self.adapters
            .iter()
            .find(|a| a.matches(url))
            .cloned()
            // Generic matches everything, but keep a hard fallback anyway.
            .unwrap_or_else(|| Arc::new(GenericAdapter))
    }

    pub fn always_needs_browser(&self, url: &Url) -> bool {
        self.get(url).always_browser()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn host_matches(url: &Url, domain: &str) -> bool {
    match url.host_str() {
        Some(host) => {
            let host = host.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{}", domain))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_registry_first_match_wins_and_generic_is_terminal() {
        let reg = AdapterRegistry::new();
        assert_eq!(reg.get(&u("https://mp.weixin.qq.com/s/abc")).name(), "wechat");
        assert_eq!(reg.get(&u("https://www.zhihu.com/question/1")).name(), "zhihu");
        assert_eq!(reg.get(&u("https://example.com/page")).name(), "generic");
        assert_eq!(reg.get(&u("https://x.com/user/status/123")).name(), "twitter");
    }

    #[test]
    fn test_always_needs_browser() {
        let reg = AdapterRegistry::new();
        assert!(reg.always_needs_browser(&u("https://mp.weixin.qq.com/s/abc")));
        assert!(reg.always_needs_browser(&u("https://abc.feishu.cn/docx/xyz")));
        assert!(!reg.always_needs_browser(&u("https://example.com/")));
        assert!(!reg.always_needs_browser(&u("https://old.reddit.com/r/rust/")));
    }

    #[test]
    fn test_host_matching_requires_label_boundary() {
        // "evilreddit.com" must not match the reddit adapter.
        let reg = AdapterRegistry::new();
        assert_eq!(reg.get(&u("https://evilreddit.com/r/x")).name(), "generic");
        assert_eq!(reg.get(&u("https://www.reddit.com/r/x")).name(), "reddit");
    }
}
