//! HTTP/1.1 request parsing and the WebSocket opening handshake (RFC 6455 §4).
//!
//! Before a connection speaks WebSocket frames it speaks plain HTTP.  The
//! client sends a GET request carrying `Upgrade: websocket`,
//! `Connection: Upgrade`, a random `Sec-WebSocket-Key` and
//! `Sec-WebSocket-Version: 13`.  The server proves it understood the request
//! by answering `101 Switching Protocols` with
//!
//! ```text
//! Sec-WebSocket-Accept = base64( SHA-1( Sec-WebSocket-Key + GUID ) )
//! ```
//!
//! The request head is parsed with `httparse` and the accept value comes from
//! [`tungstenite::handshake::derive_accept_key`].  This module only parses
//! and formats bytes; reading from and writing to the socket happens in the
//! server crate.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tungstenite::handshake::derive_accept_key;

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Largest request head (request line + headers) accepted, in bytes.
pub const MAX_REQUEST_HEAD: usize = 8192;

/// Most headers one request may carry.
pub const MAX_HEADERS: usize = 64;

/// Errors that can occur while parsing an HTTP request head.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The blank line ending the head has not arrived yet.
    #[error("incomplete request head ({0} bytes so far)")]
    InsufficientData(usize),

    /// The head grew past [`MAX_REQUEST_HEAD`] without terminating.
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// The request line or a header line could not be parsed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The request line names an HTTP version other than 1.0 or 1.1.
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
}

/// A parsed HTTP request line plus headers.  The body, if any, is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent, including any query string.
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    /// Header (name, value) pairs in arrival order, values trimmed.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Returns the first value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if any comma-separated token of header `name` equals
    /// `token` (case-insensitive).  `Connection: keep-alive, Upgrade` contains
    /// the token `upgrade`.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Request path with the query string stripped.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

/// How a request relates to the WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRequest {
    /// Ordinary HTTP request (or an upgrade aimed at another path).
    NotUpgrade,
    /// A well-formed upgrade request for the configured path.
    Valid { key: String },
    /// An upgrade request for the configured path that cannot be honoured.
    Invalid(&'static str),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parses the request head at the beginning of `bytes`.
///
/// Returns the head and the number of bytes it occupied (including the
/// terminating blank line); anything after that belongs to the next protocol
/// layer.
///
/// # Errors
///
/// [`HandshakeError::InsufficientData`] means "read more and retry".
pub fn parse_request_head(bytes: &[u8]) -> Result<(RequestHead, usize), HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let consumed = match request.parse(bytes) {
        Ok(httparse::Status::Complete(n)) if n > MAX_REQUEST_HEAD => {
            return Err(HandshakeError::HeadTooLarge(MAX_REQUEST_HEAD))
        }
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) if bytes.len() > MAX_REQUEST_HEAD => {
            return Err(HandshakeError::HeadTooLarge(MAX_REQUEST_HEAD))
        }
        Ok(httparse::Status::Partial) => {
            return Err(HandshakeError::InsufficientData(bytes.len()))
        }
        Err(httparse::Error::Version) => return Err(HandshakeError::UnsupportedVersion),
        Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
    };

    // All three are set once parsing completes.
    let (Some(method), Some(target), Some(version)) =
        (request.method, request.path, request.version)
    else {
        return Err(HandshakeError::Malformed("incomplete request line".to_string()));
    };

    let headers = request
        .headers
        .iter()
        .map(|h| {
            std::str::from_utf8(h.value)
                .map(|value| (h.name.to_string(), value.trim().to_string()))
                .map_err(|_| HandshakeError::Malformed(format!("header {} is not UTF-8", h.name)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers,
        },
        consumed,
    ))
}

/// Decides whether `head` is a WebSocket upgrade for `upgrade_path`.
pub fn classify_upgrade(head: &RequestHead, upgrade_path: &str) -> UpgradeRequest {
    let wants_upgrade = head.is_get()
        && head.header_has_token("Upgrade", "websocket")
        && head.header_has_token("Connection", "upgrade");
    if !wants_upgrade || head.path() != upgrade_path {
        return UpgradeRequest::NotUpgrade;
    }
    if head.version != 1 {
        return UpgradeRequest::Invalid("upgrade requires HTTP/1.1");
    }
    if head.header("Sec-WebSocket-Version") != Some(WEBSOCKET_VERSION) {
        return UpgradeRequest::Invalid("unsupported Sec-WebSocket-Version");
    }
    match head.header("Sec-WebSocket-Key") {
        Some(key) if is_valid_client_key(key) => UpgradeRequest::Valid {
            key: key.to_string(),
        },
        _ => UpgradeRequest::Invalid("missing or malformed Sec-WebSocket-Key"),
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    derive_accept_key(client_key.trim().as_bytes())
}

/// `101 Switching Protocols` completing the upgrade.
pub fn switching_protocols_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

/// `200 OK` carrying an HTML `body`; the server closes afterwards.
pub fn html_page_response(body: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

/// `405 Method Not Allowed` with an empty body.
pub fn method_not_allowed_response() -> Vec<u8> {
    b"HTTP/1.1 405 Method Not Allowed\r\n\
      Connection: close\r\n\
      Content-Length: 0\r\n\
      \r\n"
        .to_vec()
}

/// `400 Bad Request` for an upgrade that cannot be honoured.
pub fn bad_request_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}

fn is_valid_client_key(key: &str) -> bool {
    STANDARD
        .decode(key.trim())
        .map(|raw| raw.len() == 16)
        .unwrap_or(false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn upgrade_request(path: &str) -> Vec<u8> {
        format!(
            "GET {path} HTTP/1.1\r\n\
             Host: 127.0.0.1:1024\r\n\
             Upgrade: websocket\r\n\
             Connection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_accept_key_matches_rfc_example() {
        // RFC 6455 §1.3
        assert_eq!(accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_simple_get() {
        let raw = b"GET /index.html?x=1 HTTP/1.1\r\nHost: a\r\n\r\n";
        let (head, consumed) = parse_request_head(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html?x=1");
        assert_eq!(head.path(), "/index.html");
        assert_eq!(head.header("host"), Some("a"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_reports_leftover_bytes() {
        let mut raw = upgrade_request("/websocket");
        let head_len = raw.len();
        raw.extend_from_slice(&[0x81, 0x80]);
        let (_, consumed) = parse_request_head(&raw).unwrap();
        assert_eq!(consumed, head_len);
    }

    #[test]
    fn test_partial_head_is_insufficient() {
        assert_eq!(
            parse_request_head(b"GET / HTTP/1.1\r\nHost"),
            Err(HandshakeError::InsufficientData(20))
        );
    }

    #[test]
    fn test_oversized_head_rejected() {
        let raw = vec![b'a'; MAX_REQUEST_HEAD + 1];
        assert_eq!(
            parse_request_head(&raw),
            Err(HandshakeError::HeadTooLarge(MAX_REQUEST_HEAD))
        );
    }

    #[test]
    fn test_bad_request_line_rejected() {
        assert!(matches!(
            parse_request_head(b"NONSENSE\r\n\r\n"),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn test_http2_preface_rejected() {
        assert_eq!(
            parse_request_head(b"PRI * HTTP/2.0\r\n\r\n"),
            Err(HandshakeError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_http_1_0_upgrade_is_invalid() {
        let raw = String::from_utf8(upgrade_request("/websocket"))
            .unwrap()
            .replace("HTTP/1.1", "HTTP/1.0");
        let (head, _) = parse_request_head(raw.as_bytes()).unwrap();
        assert_eq!(head.version, 0);
        assert!(matches!(
            classify_upgrade(&head, "/websocket"),
            UpgradeRequest::Invalid(_)
        ));
    }

    #[test]
    fn test_valid_upgrade_classified() {
        let (head, _) = parse_request_head(&upgrade_request("/websocket")).unwrap();
        assert_eq!(
            classify_upgrade(&head, "/websocket"),
            UpgradeRequest::Valid {
                key: SAMPLE_KEY.to_string()
            }
        );
    }

    #[test]
    fn test_upgrade_on_other_path_is_plain_http() {
        let (head, _) = parse_request_head(&upgrade_request("/other")).unwrap();
        assert_eq!(classify_upgrade(&head, "/websocket"), UpgradeRequest::NotUpgrade);
    }

    #[test]
    fn test_plain_get_is_not_upgrade() {
        let (head, _) = parse_request_head(b"GET /websocket HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(classify_upgrade(&head, "/websocket"), UpgradeRequest::NotUpgrade);
    }

    #[test]
    fn test_wrong_version_is_invalid_upgrade() {
        let raw = String::from_utf8(upgrade_request("/websocket"))
            .unwrap()
            .replace("Version: 13", "Version: 8");
        let (head, _) = parse_request_head(raw.as_bytes()).unwrap();
        assert!(matches!(
            classify_upgrade(&head, "/websocket"),
            UpgradeRequest::Invalid(_)
        ));
    }

    #[test]
    fn test_short_key_is_invalid_upgrade() {
        let raw = String::from_utf8(upgrade_request("/websocket"))
            .unwrap()
            .replace(SAMPLE_KEY, "c2hvcnQ=");
        let (head, _) = parse_request_head(raw.as_bytes()).unwrap();
        assert!(matches!(
            classify_upgrade(&head, "/websocket"),
            UpgradeRequest::Invalid(_)
        ));
    }

    #[test]
    fn test_switching_protocols_carries_accept() {
        let response = String::from_utf8(switching_protocols_response(SAMPLE_KEY)).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_html_page_response_has_length_and_close() {
        let response = String::from_utf8(html_page_response("<p>é</p>")).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html\r\n"));
        // "é" is two bytes in UTF-8
        assert!(response.contains("Content-Length: 9\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.ends_with("<p>é</p>"));
    }

    #[test]
    fn test_method_not_allowed_has_empty_body() {
        let response = String::from_utf8(method_not_allowed_response()).unwrap();
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.contains("Content-Length: 0\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
