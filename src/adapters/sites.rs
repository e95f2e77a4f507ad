use super::{host_matches, SiteAdapter};
use crate::browser::{CapturedImage, ExtractedPage, Page, PageState};
use crate::error::ConvertError;
use crate::safety::escape_html;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;
use url::Url;

const MOBILE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

const DESKTOP_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

fn strip_all(html: String, patterns: &[&str]) -> String {
    let mut out = html;
    for p in patterns {
        if let Ok(re) = Regex::new(p) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Generic — terminal fallback, matches everything, no special behavior.
// ---------------------------------------------------------------------------

pub struct GenericAdapter;

#[async_trait]
impl SiteAdapter for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn matches(&self, _url: &Url) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// WeChat public-account articles. Mobile UA, lazy-loaded images must be
// materialized before harvest, CDN images are hotlink-protected.
// ---------------------------------------------------------------------------

pub struct WeChatAdapter;

#[async_trait]
impl SiteAdapter for WeChatAdapter {
    fn name(&self) -> &'static str {
        "wechat"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "mp.weixin.qq.com")
    }

    fn always_browser(&self) -> bool {
        true
    }

    async fn configure_page(
        &self,
        page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<(), ConvertError> {
        page.set_user_agent(MOBILE_UA).await
    }

    async fn extract(
        &self,
        page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<Option<ExtractedPage>, ConvertError> {
        // Materialize lazy images (data-src → src), then lift the article
        // container. Falls back to the whole document when absent.
        let script = r#"
            (() => {
              document.querySelectorAll('img[data-src]').forEach(img => {
                img.setAttribute('src', img.getAttribute('data-src'));
              });
              const content = document.querySelector('#js_content');
              const title = document.querySelector('#activity-name');
              if (!content) return null;
              return '<article><h1>' + (title ? title.textContent.trim() : '') + '</h1>'
                + content.innerHTML + '</article>';
            })()
        "#;
        match page.evaluate(script).await? {
            serde_json::Value::String(html) => Ok(Some(ExtractedPage {
                html,
                images: Vec::new(),
            })),
            _ => Ok(None),
        }
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[
                r"(?is)<mp-common-profile[^>]*>.*?</mp-common-profile>",
                r"(?is)<section[^>]*class=[^>]*qr_code[^>]*>.*?</section>",
            ],
        )
    }

    fn rewrite_images(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Zhihu answers/articles. Renders fine logged-out until the anti-bot wall
// kicks in; on a login wall the captured cookies fund a proxied retry.
// ---------------------------------------------------------------------------

pub struct ZhihuAdapter;

#[async_trait]
impl SiteAdapter for ZhihuAdapter {
    fn name(&self) -> &'static str {
        "zhihu"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "zhihu.com")
    }

    fn always_browser(&self) -> bool {
        true
    }

    async fn configure_page(
        &self,
        page: &dyn Page,
        state: &mut PageState,
    ) -> Result<(), ConvertError> {
        page.set_user_agent(DESKTOP_UA).await?;
        if let Some(ref cookie) = state.cookie_header {
            page.set_extra_headers(&[("Cookie".to_string(), cookie.clone())])
                .await?;
        }
        Ok(())
    }

    async fn extract(
        &self,
        page: &dyn Page,
        state: &mut PageState,
    ) -> Result<Option<ExtractedPage>, ConvertError> {
        let script = r#"
            (() => {
              if (document.querySelector('.SignFlowModal, .Modal-backdrop')) {
                return {login_wall: true};
              }
              const root = document.querySelector(
                '.Post-RichTextContainer, .QuestionAnswer-content, .RichContent-inner');
              return {login_wall: false, html: root ? root.innerHTML : null};
            })()
        "#;
        let result = page.evaluate(script).await?;

        if result["login_wall"].as_bool() == Some(true) {
            let cookies = page.cookies().await.unwrap_or_default();
            return Err(state
                .proxy_retry_error("zhihu: login wall detected", &cookies)
                .await);
        }

        match result["html"].as_str() {
            Some(html) => Ok(Some(ExtractedPage {
                html: format!("<article>{}</article>", html),
                images: Vec::new(),
            })),
            None => Ok(None),
        }
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[
                r"(?is)<div[^>]*class=[^>]*(Reward|Recommendations-Main|Comments-container)[^>]*>.*?</div>",
                r"(?is)<button[^>]*>.*?</button>",
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Yuque docs ship the full document in an embedded appData blob; decoding
// it beats rendering the SPA.
// ---------------------------------------------------------------------------

pub struct YuqueAdapter;

fn yuque_appdata_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"window\.appData\s*=\s*JSON\.parse\("((?:[^"\\]|\\.)*)"\)"#).unwrap()
    })
}

fn unescape_js_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                if let Ok(n) = u32::from_str_radix(&code, 16) {
                    if let Some(ch) = char::from_u32(n) {
                        out.push(ch);
                    }
                }
            }
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

#[async_trait]
impl SiteAdapter for YuqueAdapter {
    fn name(&self) -> &'static str {
        "yuque"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "yuque.com")
    }

    fn always_browser(&self) -> bool {
        true
    }

    fn has_fetch_direct(&self) -> bool {
        true
    }

    async fn fetch_direct(
        &self,
        client: &reqwest::Client,
        url: &Url,
    ) -> Result<Option<String>, ConvertError> {
        let body = client.get(url.as_str()).send().await?.text().await?;
        let Some(cap) = yuque_appdata_re().captures(&body) else {
            debug!("yuque: no appData blob, falling through to browser");
            return Ok(None);
        };
        let decoded = unescape_js_string(&cap[1]);
        let data: serde_json::Value = match serde_json::from_str(&decoded) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let doc = &data["doc"];
        let Some(content) = doc["content"].as_str() else {
            return Ok(None);
        };
        let title = doc["title"].as_str().unwrap_or_default();
        Ok(Some(format!(
            "<article><h1>{}</h1>{}</article>",
            escape_html(title),
            content
        )))
    }
}

// ---------------------------------------------------------------------------
// Notion public pages — client-rendered, nothing usable in static HTML.
// ---------------------------------------------------------------------------

pub struct NotionAdapter;

#[async_trait]
impl SiteAdapter for NotionAdapter {
    fn name(&self) -> &'static str {
        "notion"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "notion.site") || host_matches(url, "notion.so")
    }

    fn always_browser(&self) -> bool {
        true
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[r"(?is)<div[^>]*class=[^>]*notion-topbar[^>]*>.*?</div>"],
        )
    }
}

// ---------------------------------------------------------------------------
// Juejin posts — SPA shell statically, article renders client-side.
// ---------------------------------------------------------------------------

pub struct JuejinAdapter;

#[async_trait]
impl SiteAdapter for JuejinAdapter {
    fn name(&self) -> &'static str {
        "juejin"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "juejin.cn") || host_matches(url, "juejin.im")
    }

    fn always_browser(&self) -> bool {
        true
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[
                r"(?is)<div[^>]*class=[^>]*(sidebar|comment-container|recommended-area)[^>]*>.*?</div>",
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// CSDN blogs — server-rendered; only the chrome needs stripping.
// ---------------------------------------------------------------------------

pub struct CsdnAdapter;

#[async_trait]
impl SiteAdapter for CsdnAdapter {
    fn name(&self) -> &'static str {
        "csdn"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "csdn.net")
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[
                r"(?is)<div[^>]*id=[^>]*csdn-toolbar[^>]*>.*?</div>",
                r"(?is)<div[^>]*class=[^>]*(passport-login-container|recommend-box|comment-box)[^>]*>.*?</div>",
                r"(?is)<aside[^>]*>.*?</aside>",
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// 36kr — article body embedded in window.initialState.
// ---------------------------------------------------------------------------

pub struct ThirtySixKrAdapter;

fn kr36_state_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)window\.initialState\s*=\s*(\{.*?\})\s*</script>").unwrap()
    })
}

#[async_trait]
impl SiteAdapter for ThirtySixKrAdapter {
    fn name(&self) -> &'static str {
        "36kr"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "36kr.com")
    }

    fn has_fetch_direct(&self) -> bool {
        true
    }

    async fn fetch_direct(
        &self,
        client: &reqwest::Client,
        url: &Url,
    ) -> Result<Option<String>, ConvertError> {
        let body = client.get(url.as_str()).send().await?.text().await?;
        let Some(cap) = kr36_state_re().captures(&body) else {
            return Ok(None);
        };
        let state: serde_json::Value = match serde_json::from_str(&cap[1]) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let detail = &state["articleDetail"]["articleDetailData"]["data"];
        let Some(content) = detail["widgetContent"].as_str() else {
            return Ok(None);
        };
        let title = detail["widgetTitle"].as_str().unwrap_or_default();
        Ok(Some(format!(
            "<article><h1>{}</h1>{}</article>",
            escape_html(title),
            content
        )))
    }
}

// ---------------------------------------------------------------------------
// Toutiao — aggressive bot checks on the static path.
// ---------------------------------------------------------------------------

pub struct ToutiaoAdapter;

#[async_trait]
impl SiteAdapter for ToutiaoAdapter {
    fn name(&self) -> &'static str {
        "toutiao"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "toutiao.com")
    }

    fn always_browser(&self) -> bool {
        true
    }

    async fn configure_page(
        &self,
        page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<(), ConvertError> {
        page.set_user_agent(MOBILE_UA).await
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[r"(?is)<div[^>]*class=[^>]*(feed-card|related-list|comment-list)[^>]*>.*?</div>"],
        )
    }
}

// ---------------------------------------------------------------------------
// NetEase news — server-rendered with heavy recommendation chrome.
// ---------------------------------------------------------------------------

pub struct NetEaseAdapter;

#[async_trait]
impl SiteAdapter for NetEaseAdapter {
    fn name(&self) -> &'static str {
        "netease"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "163.com")
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[
                r"(?is)<div[^>]*class=[^>]*(post_recommend|post_next|side_ad|ntes-nav)[^>]*>.*?</div>",
                r"(?is)<footer[^>]*>.*?</footer>",
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Weibo — desktop site is an SPA; the mobile status page renders enough.
// ---------------------------------------------------------------------------

pub struct WeiboAdapter;

#[async_trait]
impl SiteAdapter for WeiboAdapter {
    fn name(&self) -> &'static str {
        "weibo"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "weibo.com") || host_matches(url, "weibo.cn")
    }

    fn always_browser(&self) -> bool {
        true
    }

    fn transform_url(&self, url: &Url) -> Option<Url> {
        // weibo.com/<uid>/<bid> → m.weibo.cn/status/<bid>
        if host_matches(url, "weibo.com") {
            let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
            if segments.len() == 2 {
                return Url::parse(&format!("https://m.weibo.cn/status/{}", segments[1])).ok();
            }
        }
        None
    }

    async fn configure_page(
        &self,
        page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<(), ConvertError> {
        page.set_user_agent(MOBILE_UA).await
    }
}

// ---------------------------------------------------------------------------
// Reddit — old.reddit.com is server-rendered; listing/comment chrome is
// stripped, the siteTable (posts) is the content.
// ---------------------------------------------------------------------------

pub struct RedditAdapter;

#[async_trait]
impl SiteAdapter for RedditAdapter {
    fn name(&self) -> &'static str {
        "reddit"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "reddit.com")
    }

    fn transform_url(&self, url: &Url) -> Option<Url> {
        let host = url.host_str()?;
        if host.eq_ignore_ascii_case("www.reddit.com") || host.eq_ignore_ascii_case("reddit.com") {
            let mut rewritten = url.clone();
            rewritten.set_host(Some("old.reddit.com")).ok()?;
            return Some(rewritten);
        }
        None
    }

    fn post_process(&self, html: String) -> String {
        strip_all(
            html,
            &[
                r#"(?is)<div[^>]*id\s*=\s*["']header["'][^>]*>.*?</div>"#,
                r#"(?is)<div[^>]*class=[^>]*\bside\b[^>]*>.*?</div>"#,
                r#"(?is)<div[^>]*class=[^>]*commentarea[^>]*>.*?</div>"#,
                r"(?is)<footer[^>]*>.*?</footer>",
            ],
        )
    }
}

// ---------------------------------------------------------------------------
// Twitter / X — single tweets come from the syndication API; everything
// else is an SPA and needs the browser.
// ---------------------------------------------------------------------------

pub struct TwitterAdapter;

fn tweet_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    while let Some(seg) = segments.next() {
        if seg == "status" || seg == "statuses" {
            let id: String = segments
                .next()?
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    None
}

#[async_trait]
impl SiteAdapter for TwitterAdapter {
    fn name(&self) -> &'static str {
        "twitter"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "twitter.com") || host_matches(url, "x.com")
    }

    fn always_browser(&self) -> bool {
        true
    }

    fn has_fetch_direct(&self) -> bool {
        true
    }

    async fn fetch_direct(
        &self,
        client: &reqwest::Client,
        url: &Url,
    ) -> Result<Option<String>, ConvertError> {
        let Some(id) = tweet_id(url) else {
            return Ok(None);
        };
        let api = format!(
            "https://cdn.syndication.twimg.com/tweet-result?id={}&token=a",
            id
        );
        let resp = client.get(&api).send().await?;
        if !resp.status().is_success() {
            debug!("twitter: syndication api status={}", resp.status());
            return Ok(None);
        }
        let tweet: serde_json::Value = resp.json().await?;
        let Some(text) = tweet["text"].as_str() else {
            return Ok(None);
        };
        let name = tweet["user"]["name"].as_str().unwrap_or("Unknown");
        let screen_name = tweet["user"]["screen_name"].as_str().unwrap_or("unknown");
        let created = tweet["created_at"].as_str().unwrap_or_default();

        let mut html = format!(
            "<article><h1>{} (@{})</h1><p>{}</p>",
            escape_html(name),
            escape_html(screen_name),
            escape_html(text).replace('\n', "<br>"),
        );
        if let Some(photos) = tweet["photos"].as_array() {
            for photo in photos {
                if let Some(src) = photo["url"].as_str() {
                    html.push_str(&format!("<img src=\"{}\">", escape_html(src)));
                }
            }
        }
        if !created.is_empty() {
            html.push_str(&format!("<p><em>{}</em></p>", escape_html(created)));
        }
        html.push_str("</article>");
        Ok(Some(html))
    }
}

// ---------------------------------------------------------------------------
// Feishu / Lark docs — virtual scroller only materializes visible blocks,
// so the harvest loop scrolls and accumulates until the block set stops
// growing. Document images are canvas-painted and captured in-page.
// ---------------------------------------------------------------------------

pub struct FeishuAdapter;

const FEISHU_NAV_TIMEOUT: Duration = Duration::from_secs(55);
const FEISHU_MAX_SCROLL_ROUNDS: usize = 40;
const FEISHU_IDLE_ROUNDS: usize = 2;

#[async_trait]
impl SiteAdapter for FeishuAdapter {
    fn name(&self) -> &'static str {
        "feishu"
    }

    fn matches(&self, url: &Url) -> bool {
        host_matches(url, "feishu.cn") || host_matches(url, "larksuite.com")
    }

    fn always_browser(&self) -> bool {
        true
    }

    fn nav_timeout(&self) -> Option<Duration> {
        Some(FEISHU_NAV_TIMEOUT)
    }

    async fn configure_page(
        &self,
        page: &dyn Page,
        _state: &mut PageState,
    ) -> Result<(), ConvertError> {
        page.set_user_agent(DESKTOP_UA).await
    }

    async fn extract(
        &self,
        page: &dyn Page,
        state: &mut PageState,
    ) -> Result<Option<ExtractedPage>, ConvertError> {
        // One scroll step: advance the scroller, then report every
        // currently-materialized block keyed by its stable block id.
        let harvest_script = r#"
            (() => {
              const scroller = document.querySelector(
                '.bear-web-x-container, .docx-scroller, [data-page-scroll]') || document.scrollingElement;
              scroller.scrollTop = scroller.scrollTop + scroller.clientHeight;
              const blocks = {};
              document.querySelectorAll('[data-block-id], .render-unit-wrapper').forEach((el, i) => {
                const id = el.getAttribute('data-block-id') || ('pos-' + i);
                blocks[id] = el.outerHTML;
              });
              return blocks;
            })()
        "#;

        let mut collected: std::collections::BTreeMap<String, String> =
            std::collections::BTreeMap::new();
        let mut idle_rounds = 0usize;

        for _ in 0..FEISHU_MAX_SCROLL_ROUNDS {
            let round = page.evaluate(harvest_script).await?;
            let before = collected.len();
            if let Some(blocks) = round.as_object() {
                for (id, html) in blocks {
                    if let Some(html) = html.as_str() {
                        collected.entry(id.clone()).or_insert_with(|| html.to_string());
                    }
                }
            }
            if collected.len() == before {
                idle_rounds += 1;
                if idle_rounds >= FEISHU_IDLE_ROUNDS {
                    break;
                }
            } else {
                idle_rounds = 0;
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        if collected.is_empty() {
            return Ok(None);
        }

        // Canvas-painted images never hit the network as <img> fetches;
        // pull them out as data URLs and persist out-of-band.
        let image_script = r#"
            (() => {
              const out = [];
              document.querySelectorAll('canvas[data-image-url], .docx-image canvas').forEach((c, i) => {
                try {
                  out.push({
                    url: c.getAttribute('data-image-url') || ('feishu-canvas-' + i),
                    data: c.toDataURL('image/png'),
                  });
                } catch (_) {}
              });
              return out;
            })()
        "#;
        if let Ok(serde_json::Value::Array(images)) = page.evaluate(image_script).await {
            for img in images {
                let (Some(url), Some(data)) = (img["url"].as_str(), img["data"].as_str()) else {
                    continue;
                };
                if let Some(b64) = data.strip_prefix("data:image/png;base64,") {
                    use base64::Engine;
                    if let Ok(bytes) =
                        base64::engine::general_purpose::STANDARD.decode(b64)
                    {
                        state.images.push(CapturedImage {
                            url: url.to_string(),
                            mime: "image/png".to_string(),
                            bytes,
                        });
                    }
                }
            }
        }

        let title = page
            .evaluate("document.title")
            .await
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();

        let mut html = format!("<article><h1>{}</h1>", escape_html(&title));
        for block in collected.values() {
            html.push_str(block);
        }
        html.push_str("</article>");

        Ok(Some(ExtractedPage {
            html,
            images: std::mem::take(&mut state.images),
        }))
    }

    fn rewrite_images(&self) -> bool {
        true
    }
}
