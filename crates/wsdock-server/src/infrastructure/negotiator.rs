//! UpgradeNegotiator: the plain-HTTP phase of every connection.
//!
//! Each accepted connection sends exactly one HTTP request.  The negotiator
//! reads its head and does exactly one of:
//!
//! | Request                                   | Response                       |
//! |-------------------------------------------|--------------------------------|
//! | valid upgrade on the configured path      | `101`, connection upgraded     |
//! | upgrade on the path but bad key/version   | `400`, then close              |
//! | any other GET (including other paths)     | `200` info page, then close    |
//! | any other method                          | `405`, then close              |
//! | unparseable head                          | `400`, then close              |
//!
//! Once upgraded, HTTP handling is over for that connection; any bytes the
//! client pipelined after its request head are returned so the frame layer
//! sees them.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use wsdock_core::protocol::handshake::{
    bad_request_response, classify_upgrade, html_page_response, method_not_allowed_response,
    parse_request_head, switching_protocols_response, HandshakeError, UpgradeRequest,
};

const INFO_PAGE_TEMPLATE: &str = include_str!("../../assets/index.html");
const PATH_PLACEHOLDER: &str = "{{WS_PATH}}";
const READ_CHUNK: usize = 4096;

/// Errors that end the HTTP phase without a response being possible.
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("I/O error during HTTP negotiation: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed before sending a complete request head.
    #[error("connection closed before the request head was complete")]
    ConnectionClosed,
}

/// How the HTTP phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateOutcome {
    /// `101` sent.  `leftover` holds bytes received after the request head.
    Upgraded { leftover: Vec<u8> },
    /// `200` info page sent; close the connection.
    PageServed,
    /// `405` sent; close the connection.
    MethodNotAllowed,
    /// `400` sent; close the connection.
    BadRequest(String),
}

/// Serves the HTTP phase for one configured upgrade path.
#[derive(Debug, Clone)]
pub struct UpgradeNegotiator {
    upgrade_path: String,
    page: String,
}

impl UpgradeNegotiator {
    pub fn new(upgrade_path: impl Into<String>) -> Self {
        let upgrade_path = upgrade_path.into();
        let page = INFO_PAGE_TEMPLATE.replace(PATH_PLACEHOLDER, &upgrade_path);
        Self { upgrade_path, page }
    }

    /// The informational HTML page served for plain GET requests.
    pub fn page(&self) -> &str {
        &self.page
    }

    /// Reads one request head from `stream` and answers it.
    ///
    /// The response is written and flushed before returning.  For every
    /// outcome except [`NegotiateOutcome::Upgraded`] the caller should shut
    /// the connection down.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiateError`] if the peer disconnects early or I/O fails.
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<NegotiateOutcome, NegotiateError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        let parsed = loop {
            match parse_request_head(&buf) {
                Err(HandshakeError::InsufficientData(_)) => {}
                other => break other,
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(NegotiateError::ConnectionClosed);
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let (head, consumed) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("rejecting unparseable request: {e}");
                respond(stream, &bad_request_response()).await?;
                return Ok(NegotiateOutcome::BadRequest(e.to_string()));
            }
        };

        match classify_upgrade(&head, &self.upgrade_path) {
            UpgradeRequest::Valid { key } => {
                respond(stream, &switching_protocols_response(&key)).await?;
                Ok(NegotiateOutcome::Upgraded {
                    leftover: buf.split_off(consumed),
                })
            }
            UpgradeRequest::Invalid(reason) => {
                debug!("rejecting upgrade request: {reason}");
                respond(stream, &bad_request_response()).await?;
                Ok(NegotiateOutcome::BadRequest(reason.to_string()))
            }
            UpgradeRequest::NotUpgrade if head.is_get() => {
                debug!("serving info page for {}", head.target);
                respond(stream, &html_page_response(&self.page)).await?;
                Ok(NegotiateOutcome::PageServed)
            }
            UpgradeRequest::NotUpgrade => {
                debug!("method {} not allowed", head.method);
                respond(stream, &method_not_allowed_response()).await?;
                Ok(NegotiateOutcome::MethodNotAllowed)
            }
        }
    }
}

async fn respond<S>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const UPGRADE: &[u8] = b"GET /websocket HTTP/1.1\r\n\
        Host: 127.0.0.1:1024\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn negotiator() -> UpgradeNegotiator {
        UpgradeNegotiator::new("/websocket")
    }

    #[test]
    fn test_page_points_at_upgrade_path() {
        let page = UpgradeNegotiator::new("/chat").page().to_string();
        assert!(page.contains("\"/chat\""));
        assert!(!page.contains(PATH_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_valid_upgrade_writes_101() {
        let mut stream = Builder::new()
            .read(UPGRADE)
            .write(&switching_protocols_response("dGhlIHNhbXBsZSBub25jZQ=="))
            .build();

        let outcome = negotiator().negotiate(&mut stream).await.unwrap();

        assert_eq!(outcome, NegotiateOutcome::Upgraded { leftover: vec![] });
    }

    #[tokio::test]
    async fn test_pipelined_frame_bytes_are_returned() {
        let mut wire = UPGRADE.to_vec();
        wire.extend_from_slice(&[0x81, 0x80, 1, 2, 3, 4]);
        let mut stream = Builder::new()
            .read(&wire)
            .write(&switching_protocols_response("dGhlIHNhbXBsZSBub25jZQ=="))
            .build();

        let outcome = negotiator().negotiate(&mut stream).await.unwrap();

        assert_eq!(
            outcome,
            NegotiateOutcome::Upgraded {
                leftover: vec![0x81, 0x80, 1, 2, 3, 4]
            }
        );
    }

    #[tokio::test]
    async fn test_head_split_across_reads() {
        let mut stream = Builder::new()
            .read(&UPGRADE[..10])
            .read(&UPGRADE[10..50])
            .read(&UPGRADE[50..])
            .write(&switching_protocols_response("dGhlIHNhbXBsZSBub25jZQ=="))
            .build();

        let outcome = negotiator().negotiate(&mut stream).await.unwrap();

        assert!(matches!(outcome, NegotiateOutcome::Upgraded { .. }));
    }

    #[tokio::test]
    async fn test_plain_get_serves_info_page() {
        let nego = negotiator();
        let mut stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .write(&html_page_response(nego.page()))
            .build();

        assert_eq!(
            nego.negotiate(&mut stream).await.unwrap(),
            NegotiateOutcome::PageServed
        );
    }

    #[tokio::test]
    async fn test_upgrade_on_other_path_serves_info_page() {
        let nego = negotiator();
        let request = String::from_utf8(UPGRADE.to_vec())
            .unwrap()
            .replace("/websocket", "/elsewhere");
        let mut stream = Builder::new()
            .read(request.as_bytes())
            .write(&html_page_response(nego.page()))
            .build();

        assert_eq!(
            nego.negotiate(&mut stream).await.unwrap(),
            NegotiateOutcome::PageServed
        );
    }

    #[tokio::test]
    async fn test_post_gets_405() {
        let mut stream = Builder::new()
            .read(b"POST /websocket HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
            .write(&method_not_allowed_response())
            .build();

        assert_eq!(
            negotiator().negotiate(&mut stream).await.unwrap(),
            NegotiateOutcome::MethodNotAllowed
        );
    }

    #[tokio::test]
    async fn test_bad_version_gets_400() {
        let request = String::from_utf8(UPGRADE.to_vec())
            .unwrap()
            .replace("Version: 13", "Version: 7");
        let mut stream = Builder::new()
            .read(request.as_bytes())
            .write(&bad_request_response())
            .build();

        assert!(matches!(
            negotiator().negotiate(&mut stream).await.unwrap(),
            NegotiateOutcome::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_garbage_request_gets_400() {
        let mut stream = Builder::new()
            .read(b"HELLO\r\n\r\n")
            .write(&bad_request_response())
            .build();

        assert!(matches!(
            negotiator().negotiate(&mut stream).await.unwrap(),
            NegotiateOutcome::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_early_eof_is_connection_closed() {
        let mut stream = Builder::new().read(b"GET / HTTP/1.1\r\nHo").build();

        assert!(matches!(
            negotiator().negotiate(&mut stream).await,
            Err(NegotiateError::ConnectionClosed)
        ));
    }
}
