use base64::Engine;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Hard cap on proxied response size.
pub const MAX_PROXY_RESPONSE: usize = 8 * 1024 * 1024;

/// A forward proxy endpoint with basic-auth credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
pub enum ProxyError {
    InvalidConfig(String),
    InvalidHeader(String),
    InvalidStatus(String),
    InvalidChunked(String),
    TooLarge(usize),
    Timeout,
    Aborted,
    Io(String),
    PoolExhausted { attempts: usize, errors: Vec<String> },
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::InvalidConfig(msg) => write!(f, "invalid proxy config: {}", msg),
            ProxyError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
            ProxyError::InvalidStatus(msg) => write!(f, "invalid status line: {}", msg),
            ProxyError::InvalidChunked(msg) => write!(f, "invalid chunked encoding: {}", msg),
            ProxyError::TooLarge(n) => write!(f, "proxied response exceeds {} bytes", n),
            ProxyError::Timeout => write!(f, "proxy fetch timed out"),
            ProxyError::Aborted => write!(f, "aborted"),
            ProxyError::Io(msg) => write!(f, "proxy io error: {}", msg),
            ProxyError::PoolExhausted { attempts, errors } => write!(
                f,
                "proxy pool exhausted after {} attempts: [{}]",
                attempts,
                errors.join("; ")
            ),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ProxyError> for crate::error::ConvertError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Timeout => crate::error::ConvertError::FetchTimeout(e.to_string()),
            other => crate::error::ConvertError::FetchFailed(other.to_string()),
        }
    }
}

impl ProxyConfig {
    /// Parse `user:pass@host:port`. Bracketed IPv6 hosts are supported
    /// (`user:pass@[::1]:8080`). Any whitespace invalidates the input.
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        if raw.is_empty() {
            return Err(ProxyError::InvalidConfig("empty proxy spec".into()));
        }
        if raw.chars().any(|c| c.is_whitespace()) {
            return Err(ProxyError::InvalidConfig("whitespace in proxy spec".into()));
        }

        let (creds, addr) = raw
            .rsplit_once('@')
            .ok_or_else(|| ProxyError::InvalidConfig("missing '@' separator".into()))?;
        let (username, password) = creds
            .split_once(':')
            .ok_or_else(|| ProxyError::InvalidConfig("missing ':' in credentials".into()))?;
        if username.is_empty() {
            return Err(ProxyError::InvalidConfig("empty username".into()));
        }

        let (host, port_str) = if let Some(rest) = addr.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| ProxyError::InvalidConfig("unterminated IPv6 bracket".into()))?;
            let host = &rest[..end];
            let tail = &rest[end + 1..];
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| ProxyError::InvalidConfig("missing port after IPv6 host".into()))?;
            (host, port)
        } else {
            addr.rsplit_once(':')
                .ok_or_else(|| ProxyError::InvalidConfig("missing ':' before port".into()))?
        };

        if host.is_empty() {
            return Err(ProxyError::InvalidConfig("empty host".into()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| ProxyError::InvalidConfig(format!("bad port: {}", port_str)))?;
        if port == 0 {
            return Err(ProxyError::InvalidConfig("port must be 1-65535".into()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Case-insensitive identity used for pool deduplication.
    pub fn dedupe_key(&self) -> (String, String, String, u16) {
        (
            self.username.clone(),
            self.password.clone(),
            self.host.to_ascii_lowercase(),
            self.port,
        )
    }
}

/// Parsed proxied response. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn is_token_char(c: u8) -> bool {
    // RFC 7230 token
    matches!(c,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~')
        || c.is_ascii_alphanumeric()
}

fn validate_caller_headers(headers: &[(String, String)]) -> Result<(), ProxyError> {
    for (name, value) in headers {
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(ProxyError::InvalidHeader(format!("bad header name: {}", name)));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(ProxyError::InvalidHeader(format!(
                "CR/LF in value of {}",
                name
            )));
        }
    }
    Ok(())
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match (url.scheme(), url.port()) {
        (_, None) => host.to_string(),
        ("http", Some(80)) | ("https", Some(443)) => host.to_string(),
        (_, Some(p)) => format!("{}:{}", host, p),
    }
}

/// Fetch `url` through a forward proxy over plain TCP.
///
/// Writes an absolute-URI GET with `Proxy-Authorization`, reads to EOF under
/// `timeout` and the 8 MB cap, then parses the status line, headers and
/// (possibly chunked) body. The socket is closed on every exit path because
/// it lives inside the raced future.
pub async fn fetch_via_proxy(
    proxy: &ProxyConfig,
    url: &Url,
    headers: &[(String, String)],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProxyResponse, ProxyError> {
    validate_caller_headers(headers)?;

    let mut request = String::with_capacity(256);
    request.push_str("GET ");
    request.push_str(url.as_str());
    request.push_str(" HTTP/1.1\r\n");
    request.push_str("Host: ");
    request.push_str(&host_header(url));
    request.push_str("\r\n");

    let auth = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", proxy.username, proxy.password));
    request.push_str("Proxy-Authorization: Basic ");
    request.push_str(&auth);
    request.push_str("\r\n");

    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("Connection: close\r\n\r\n");

    let io = async {
        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| ProxyError::Io(format!("connect: {}", e)))?;
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| ProxyError::Io(format!("write: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| ProxyError::Io(format!("flush: {}", e)))?;

        let mut raw = Vec::with_capacity(16 * 1024);
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| ProxyError::Io(format!("read: {}", e)))?;
            if n == 0 {
                break;
            }
            if raw.len() + n > MAX_PROXY_RESPONSE {
                return Err(ProxyError::TooLarge(MAX_PROXY_RESPONSE));
            }
            raw.extend_from_slice(&buf[..n]);
        }
        Ok(raw)
    };

    let raw = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::Aborted),
        res = tokio::time::timeout(timeout, io) => match res {
            Ok(inner) => inner?,
            Err(_) => return Err(ProxyError::Timeout),
        },
    };

    parse_response(&raw)
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn parse_response(raw: &[u8]) -> Result<ProxyResponse, ProxyError> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ProxyError::InvalidStatus("no header terminator".into()))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| ProxyError::InvalidStatus("non-utf8 header block".into()))?;
    let body = &raw[header_end + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = parse_status_line(status_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::InvalidStatus(format!("bad header line: {}", line)))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    let chunked = headers
        .iter()
        .filter(|(n, _)| n == "transfer-encoding")
        .any(|(_, v)| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")));

    let body = if chunked {
        Bytes::from(decode_chunked(body)?)
    } else {
        Bytes::copy_from_slice(body)
    };

    Ok(ProxyResponse {
        status,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<u16, ProxyError> {
    // "HTTP/x.y NNN reason"
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::InvalidStatus(line.to_string()));
    }
    let ver = &version[5..];
    if ver.is_empty() || !ver.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(ProxyError::InvalidStatus(line.to_string()));
    }
    let code = parts
        .next()
        .ok_or_else(|| ProxyError::InvalidStatus(line.to_string()))?;
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ProxyError::InvalidStatus(line.to_string()));
    }
    code.parse()
        .map_err(|_| ProxyError::InvalidStatus(line.to_string()))
}

/// Decode a chunked transfer-coded body. Chunk extensions are permitted,
/// trailers are skipped, and bytes after the terminating chunk are an error.
pub fn decode_chunked(data: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0usize;

    loop {
        let line_end = find_crlf(data, pos)
            .ok_or_else(|| ProxyError::InvalidChunked("missing chunk size line".into()))?;
        let line = std::str::from_utf8(&data[pos..line_end])
            .map_err(|_| ProxyError::InvalidChunked("non-utf8 chunk size".into()))?;
        pos = line_end + 2;

        let size_str = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::InvalidChunked(format!("non-hex chunk size: {}", size_str)))?;

        if size == 0 {
            // Optional trailer lines, then a terminating empty line.
            loop {
                let end = find_crlf(data, pos)
                    .ok_or_else(|| ProxyError::InvalidChunked("unterminated trailers".into()))?;
                let trailer = &data[pos..end];
                pos = end + 2;
                if trailer.is_empty() {
                    break;
                }
            }
            if pos != data.len() {
                return Err(ProxyError::InvalidChunked("bytes after terminator".into()));
            }
            return Ok(out);
        }

        if pos + size + 2 > data.len() {
            return Err(ProxyError::InvalidChunked("truncated chunk".into()));
        }
        out.extend_from_slice(&data[pos..pos + size]);
        pos += size;
        if &data[pos..pos + 2] != b"\r\n" {
            return Err(ProxyError::InvalidChunked("chunk data not CRLF-terminated".into()));
        }
        pos += 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_config() {
        let p = ProxyConfig::parse("alice:s3cret@proxy.example.com:8080").unwrap();
        assert_eq!(p.host, "proxy.example.com");
        assert_eq!(p.port, 8080);
        assert_eq!(p.username, "alice");
        assert_eq!(p.password, "s3cret");
    }

    #[test]
    fn test_parse_proxy_config_ipv6() {
        let p = ProxyConfig::parse("u:p@[2001:db8::1]:3128").unwrap();
        assert_eq!(p.host, "2001:db8::1");
        assert_eq!(p.port, 3128);
    }

    #[test]
    fn test_parse_proxy_config_password_with_at() {
        // rsplit on '@' keeps '@' inside the password.
        let p = ProxyConfig::parse("u:p@ss@proxy:1080").unwrap();
        assert_eq!(p.username, "u");
        assert_eq!(p.password, "p@ss");
    }

    #[test]
    fn test_parse_proxy_config_rejects() {
        assert!(ProxyConfig::parse("").is_err());
        assert!(ProxyConfig::parse("u:p @proxy:8080").is_err());
        assert!(ProxyConfig::parse("no-at-sign:8080").is_err());
        assert!(ProxyConfig::parse("u:p@proxy:0").is_err());
        assert!(ProxyConfig::parse("u:p@proxy:99999").is_err());
        assert!(ProxyConfig::parse("u:p@proxy").is_err());
    }

    #[test]
    fn test_status_line() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK").unwrap(), 200);
        assert_eq!(parse_status_line("HTTP/1.0 404 Not Found").unwrap(), 404);
        assert_eq!(parse_status_line("HTTP/2 502 Bad Gateway").unwrap(), 502);
        assert!(parse_status_line("ICY 200 OK").is_err());
        assert!(parse_status_line("HTTP/1.1 20 OK").is_err());
        assert!(parse_status_line("HTTP/1.1").is_err());
        assert!(parse_status_line("garbage").is_err());
    }

    #[test]
    fn test_chunked_roundtrip() {
        // Property: for any body B, encode-then-decode yields B.
        let bodies: &[&[u8]] = &[
            b"hello world",
            "非对称加密中文 multi-byte ✓".as_bytes(),
            b"",
            &[0u8; 4096],
        ];
        for body in bodies {
            let mut encoded = Vec::new();
            for chunk in body.chunks(7) {
                encoded.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                encoded.extend_from_slice(chunk);
                encoded.extend_from_slice(b"\r\n");
            }
            encoded.extend_from_slice(b"0\r\n\r\n");
            assert_eq!(&decode_chunked(&encoded).unwrap(), body);
        }
    }

    #[test]
    fn test_chunked_with_extension_and_trailers() {
        let encoded = b"5;ext=1\r\nhello\r\n0\r\nX-Trailer: v\r\n\r\n";
        assert_eq!(decode_chunked(encoded).unwrap(), b"hello");
    }

    #[test]
    fn test_chunked_rejects_malformed() {
        assert!(matches!(
            decode_chunked(b"zz\r\nhello\r\n0\r\n\r\n"),
            Err(ProxyError::InvalidChunked(_))
        ));
        // missing CRLF after chunk data
        assert!(matches!(
            decode_chunked(b"5\r\nhelloXX0\r\n\r\n"),
            Err(ProxyError::InvalidChunked(_))
        ));
        // bytes after terminator
        assert!(matches!(
            decode_chunked(b"5\r\nhello\r\n0\r\n\r\nextra"),
            Err(ProxyError::InvalidChunked(_))
        ));
    }

    #[test]
    fn test_parse_response_plain_and_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>ok</html>";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("content-type"), Some("text/html"));
        assert_eq!(resp.body_string(), "<html>ok</html>");

        let raw =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.body_string(), "body");
    }

    #[test]
    fn test_caller_header_validation() {
        assert!(validate_caller_headers(&[("X-Ok".into(), "v".into())]).is_ok());
        assert!(validate_caller_headers(&[("Bad Name".into(), "v".into())]).is_err());
        assert!(validate_caller_headers(&[("X-Ok".into(), "v\r\nInjected: 1".into())]).is_err());
    }

    #[tokio::test]
    async fn test_fetch_via_local_proxy() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(req.starts_with("GET http://example.com/page HTTP/1.1\r\n"));
            assert!(req.contains("Proxy-Authorization: Basic "));
            assert!(req.contains("Connection: close"));
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n7\r\ncontent\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        });

        let proxy = ProxyConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            username: "u".into(),
            password: "p".into(),
        };
        let url = Url::parse("http://example.com/page").unwrap();
        let resp = fetch_via_proxy(
            &proxy,
            &url,
            &[("User-Agent".into(), "test".into())],
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_string(), "content");
    }

    #[tokio::test]
    async fn test_fetch_respects_cancellation() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection open without responding.
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let proxy = ProxyConfig {
            host: "127.0.0.1".into(),
            port: addr.port(),
            username: "u".into(),
            password: "p".into(),
        };
        let url = Url::parse("http://example.com/").unwrap();
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c2.cancel();
        });
        let err = fetch_via_proxy(&proxy, &url, &[], Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Aborted));
    }
}
