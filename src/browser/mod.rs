pub mod gate;

pub use gate::{GateError, RenderGate, RenderPermit};

use crate::error::ConvertError;
use crate::retry_token::{CapturedCookie, RetryTokenStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// An image harvested inside the browser (e.g. canvas-painted document
/// images that never hit the network as plain `<img>` fetches).
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub url: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Result of an adapter-driven extraction from a rendered page.
#[derive(Debug)]
pub struct ExtractedPage {
    pub html: String,
    pub images: Vec<CapturedImage>,
}

/// Mutable per-render state shared between `configure_page` and `extract`.
pub struct PageState {
    pub retry_tokens: Arc<RetryTokenStore>,
    /// Cookie header to install before navigation (second-chance renders).
    pub cookie_header: Option<String>,
    pub images: Vec<CapturedImage>,
}

impl PageState {
    pub fn new(retry_tokens: Arc<RetryTokenStore>) -> Self {
        Self {
            retry_tokens,
            cookie_header: None,
            images: Vec::new(),
        }
    }

    /// Build the error an adapter returns when it wants the pipeline to
    /// retry through a forward proxy with the cookies captured in-page.
    pub async fn proxy_retry_error(
        &self,
        context: &str,
        cookies: &[CapturedCookie],
    ) -> ConvertError {
        let marker = self.retry_tokens.create_retry_signal(cookies).await;
        ConvertError::FetchFailed(format!("{} {}", context, marker))
    }
}

/// A rendered browser page. The engine behind it is an external
/// collaborator (CDP endpoint, platform binding); the pipeline only
/// depends on this seam.
#[async_trait]
pub trait Page: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), ConvertError>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<(), ConvertError>;

    async fn set_extra_headers(&self, headers: &[(String, String)]) -> Result<(), ConvertError>;

    /// Serialized outer HTML of the current document.
    async fn content(&self) -> Result<String, ConvertError>;

    /// Evaluate a JS expression, returning its JSON-serialized result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, ConvertError>;

    async fn cookies(&self) -> Result<Vec<CapturedCookie>, ConvertError>;

    async fn close(&self) -> Result<(), ConvertError> {
        Ok(())
    }
}

/// Factory for rendered pages. Absent engine means browser-path requests
/// fail with `FetchFailed` (the gate still guards whatever is configured).
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn Page>, ConvertError>;
}
