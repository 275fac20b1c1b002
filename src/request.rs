use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use url::Url;

/// The pieces of a `ws://` / `wss://` URI the connect sequence needs. The
/// URL crate does the heavy parsing; this keeps only what ends up in the
/// socket address and the request lines.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UriParts {
    pub host: String,
    pub port: u16,
    pub request_path: String,
    pub use_tls: bool,
}

impl UriParts {
    pub fn host_with_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Validates the scheme and splits the URI into host, port, path and the
/// TLS bit. Only `ws` and `wss` are accepted; the default ports are the
/// HTTP ones the RFC assigns to each scheme.
pub(crate) fn parse_uri(ws_url: &str) -> Result<UriParts, Error> {
    let parsed_url = Url::parse(ws_url)?;

    let (default_port, use_tls) = match parsed_url.scheme() {
        "ws" => (80, false),
        "wss" => (443, true),
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?.to_string();
    let port = parsed_url.port().unwrap_or(default_port);

    // Query parameters ride along in the request target
    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    Ok(UriParts {
        host,
        port,
        request_path,
        use_tls,
    })
}

/// Builds the HTTP/1.1 upgrade request. Everything is fixed except the
/// request target, the host, the nonce key and the optional compression
/// offer, so the request is assembled as a plain string and converted to
/// bytes at send time.
pub(crate) fn build_upgrade_request(
    parts: &UriParts,
    key: &str,
    compression_offer: Option<&str>,
) -> String {
    let request_path = if parts.request_path.is_empty() {
        "/"
    } else {
        parts.request_path.as_str()
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        request_path,
        parts.host_with_port(),
        key,
    );
    if let Some(offer) = compression_offer {
        request.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", offer));
    }
    request.push_str("\r\n");

    request
}

/// Builds the `CONNECT` request that opens a tunnel through an HTTP proxy.
/// Credentials, when configured, travel as Basic auth.
pub(crate) fn build_connect_request(
    parts: &UriParts,
    username: Option<&str>,
    password: Option<&str>,
) -> String {
    let target = parts.host_with_port();
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
        target, target,
    );
    if let Some(user) = username {
        let credentials = format!("{}:{}", user, password.unwrap_or(""));
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64_STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");

    request
}
