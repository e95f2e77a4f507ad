use http::StatusCode;
use std::fmt;

/// Conversion pipeline error. Every variant maps to a stable wire `kind`
/// and an HTTP status; the message is caller-facing and must never carry
/// raw retry cookies (see `retry_token::redact`).
#[derive(Debug, Clone)]
pub enum ConvertError {
    InvalidUrl(String),
    Blocked(String),
    InvalidFormat(String),
    InvalidSelector(String),
    InvalidRequest(String),
    Unauthorized,
    RequestTooLarge(usize),
    UnsupportedContent(String),
    FetchFailed(String),
    FetchTimeout(String),
    Misconfigured(String),
    Internal(String),
}

impl ConvertError {
    /// Stable wire kind, serialized as the `error` field of error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ConvertError::InvalidUrl(_) => "InvalidURL",
            ConvertError::Blocked(_) => "Blocked",
            ConvertError::InvalidFormat(_) => "InvalidFormat",
            ConvertError::InvalidSelector(_) => "InvalidSelector",
            ConvertError::InvalidRequest(_) => "InvalidRequest",
            ConvertError::Unauthorized => "Unauthorized",
            ConvertError::RequestTooLarge(_) => "RequestTooLarge",
            ConvertError::UnsupportedContent(_) => "UnsupportedContent",
            ConvertError::FetchFailed(_) => "FetchFailed",
            ConvertError::FetchTimeout(_) => "FetchTimeout",
            ConvertError::Misconfigured(_) => "Misconfigured",
            ConvertError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ConvertError::InvalidUrl(_)
            | ConvertError::InvalidFormat(_)
            | ConvertError::InvalidSelector(_)
            | ConvertError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ConvertError::Unauthorized => StatusCode::UNAUTHORIZED,
            ConvertError::Blocked(_) => StatusCode::FORBIDDEN,
            ConvertError::RequestTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ConvertError::UnsupportedContent(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ConvertError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            ConvertError::FetchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ConvertError::Misconfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            ConvertError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Upstream status code carried in a `FetchFailed` message, when present.
    /// The static-fetch path formats these as `Status: NNN <text>`.
    pub fn upstream_status(&self) -> Option<u16> {
        let msg = match self {
            ConvertError::FetchFailed(m) => m,
            _ => return None,
        };
        let rest = msg.split("Status: ").nth(1)?;
        rest.split_whitespace().next()?.parse().ok()
    }
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::InvalidUrl(msg) => write!(f, "invalid url: {}", msg),
            ConvertError::Blocked(msg) => write!(f, "blocked: {}", msg),
            ConvertError::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            ConvertError::InvalidSelector(msg) => write!(f, "invalid selector: {}", msg),
            ConvertError::InvalidRequest(msg) => write!(f, "{}", msg),
            ConvertError::Unauthorized => write!(f, "unauthorized"),
            ConvertError::RequestTooLarge(_) => write!(f, "Request too large"),
            ConvertError::UnsupportedContent(ct) => write!(f, "unsupported content type: {}", ct),
            ConvertError::FetchFailed(msg) => write!(f, "fetch failed: {}", msg),
            ConvertError::FetchTimeout(msg) => write!(f, "fetch timed out: {}", msg),
            ConvertError::Misconfigured(msg) => write!(f, "misconfigured: {}", msg),
            ConvertError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ConvertError {}

impl From<reqwest::Error> for ConvertError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConvertError::FetchTimeout(e.to_string())
        } else {
            ConvertError::FetchFailed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_mapping() {
        assert_eq!(ConvertError::InvalidUrl("x".into()).kind(), "InvalidURL");
        assert_eq!(
            ConvertError::InvalidUrl("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ConvertError::Blocked("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ConvertError::UnsupportedContent("image/png".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ConvertError::FetchFailed("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ConvertError::FetchTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ConvertError::Misconfigured("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_upstream_status_parsing() {
        let e = ConvertError::FetchFailed("upstream returned Status: 429 Too Many Requests".into());
        assert_eq!(e.upstream_status(), Some(429));

        let e = ConvertError::FetchFailed("connection refused".into());
        assert_eq!(e.upstream_status(), None);

        let e = ConvertError::FetchTimeout("Status: 504".into());
        assert_eq!(e.upstream_status(), None);
    }

    #[test]
    fn test_timeout_message_matches_taxonomy() {
        // §7: FetchTimeout messages must match /timed? out|timeout/.
        let msg = ConvertError::FetchTimeout("deadline expired".into()).to_string();
        assert!(msg.contains("timed out") || msg.contains("timeout"));
    }
}
