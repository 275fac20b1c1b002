use crate::client::WsClient;
use crate::error::Error;
use crate::extensions::{parse_server_extensions, render_offer, NegotiatedCompression};
use crate::inflate::inflate_available;
use crate::options::ClientOptions;
use crate::pool::Assembler;
use crate::request::{build_connect_request, build_upgrade_request, parse_uri, UriParts};
use crate::stream::FeedFlowStream;
use crate::utils::{
    accept_keys_match, generate_websocket_accept_value, generate_websocket_key, with_cancel,
};
use log::debug;
use pki_types::ServerName;
use rustls::{ClientConfig as TlsConfig, RootCertStore};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

/// Connects with default options and a fresh cancellation token.
pub async fn connect_async(addr: &str) -> Result<WsClient, Error> {
    connect_async_with_config(addr, ClientOptions::default(), CancellationToken::new()).await
}

/// Drives the whole connect sequence: TCP (optionally through an HTTP
/// CONNECT tunnel), TLS for `wss`, then the HTTP/1.1 upgrade with accept
/// validation and compression negotiation. Cancelling the token fails the
/// pending step with [`Error::Cancelled`] and abandons the half-open
/// transport.
pub async fn connect_async_with_config(
    addr: &str,
    options: ClientOptions,
    cancel: CancellationToken,
) -> Result<WsClient, Error> {
    options.validate()?;
    if options.compression && !inflate_available() {
        return Err(Error::CompressionUnavailable);
    }

    let parts = parse_uri(addr)?;
    let tcp = with_cancel(&cancel, open_tcp(&parts, &options)).await?;

    let mut stream = if parts.use_tls {
        with_cancel(&cancel, wrap_tls(tcp, &parts.host)).await?
    } else {
        FeedFlowStream::Plain(tcp)
    };

    let negotiated = match with_cancel(&cancel, upgrade(&mut stream, &parts, &options)).await {
        Ok(negotiated) => negotiated,
        Err(err) => {
            // the transport is half-open at best, drop it on the floor
            let _ = stream.shutdown().await;
            return Err(err);
        }
    };

    debug!(
        "connected to {} (tls: {}, compression: {})",
        parts.host_with_port(),
        stream.is_tls(),
        negotiated.enabled
    );
    Ok(WsClient::new(stream, &options, negotiated, cancel))
}

/// Resolves and connects the TCP leg. With a proxy configured the socket
/// goes to the proxy and the target is reached through CONNECT; the target
/// hostname is then resolved by the proxy, not here.
async fn open_tcp(parts: &UriParts, options: &ClientOptions) -> Result<TcpStream, Error> {
    let (connect_host, connect_port) = match &options.proxy {
        Some(proxy) => (proxy.host.as_str(), proxy.port),
        None => (parts.host.as_str(), parts.port),
    };

    let address = lookup_host((connect_host, connect_port))
        .await?
        .next()
        .ok_or(Error::DnsResolveFailed)?;
    let stream = TcpStream::connect(address).await?;
    // latency-sensitive consumers can't afford Nagle batching
    stream.set_nodelay(true)?;

    if let Some(proxy) = &options.proxy {
        return tunnel_through_proxy(stream, parts, options, proxy.username.as_deref(), proxy.password.as_deref()).await;
    }
    Ok(stream)
}

async fn tunnel_through_proxy(
    mut stream: TcpStream,
    parts: &UriParts,
    options: &ClientOptions,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<TcpStream, Error> {
    let request = build_connect_request(parts, username, password);
    stream.write_all(request.as_bytes()).await?;

    let response = read_http_response(&mut stream, options.handshake_buffer_size).await?;
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut headers);
    let status = parsed.parse(response.as_slice())?;
    if !status.is_complete() {
        return Err(Error::ProxyConnectFailed(0));
    }
    match parsed.code {
        Some(200) => {
            debug!("proxy tunnel to {} established", parts.host_with_port());
            Ok(stream)
        }
        code => Err(Error::ProxyConnectFailed(code.unwrap_or(0))),
    }
}

async fn wrap_tls(tcp: TcpStream, host: &str) -> Result<FeedFlowStream, Error> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    // rustls negotiates TLS 1.2 or 1.3 and does not check revocation; a
    // deployment that needs revocation must install its own verifier
    let config = TlsConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())?;
    let tls_stream = connector.connect(server_name, tcp).await?;
    Ok(FeedFlowStream::Secure(Box::new(tls_stream)))
}

/// Sends the GET upgrade and validates the 101 response: upgrade headers,
/// constant-time accept-key comparison, extension negotiation.
async fn upgrade(
    stream: &mut FeedFlowStream,
    parts: &UriParts,
    options: &ClientOptions,
) -> Result<NegotiatedCompression, Error> {
    let key = generate_websocket_key();
    let offer = render_offer(options)?;
    let request = build_upgrade_request(parts, &key, offer.as_deref());

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let response = read_http_response(stream, options.handshake_buffer_size).await?;
    validate_upgrade_response(response.as_slice(), &key, offer.is_some())
}

/// Reads the response headers byte by byte up to the CRLF-CRLF terminator,
/// never consuming anything past it: frame bytes may follow immediately.
async fn read_http_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_size: usize,
) -> Result<Assembler, Error> {
    let mut response = Assembler::with_capacity(max_size.min(2048));
    let mut byte = [0u8; 1];
    loop {
        if response.len() >= max_size {
            return Err(Error::HandshakeTooLarge);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::ConnectionTruncated);
        }
        response.append(&byte);
        if response.as_slice().ends_with(b"\r\n\r\n") {
            return Ok(response);
        }
    }
}

fn validate_upgrade_response(
    bytes: &[u8],
    key: &str,
    compression_offered: bool,
) -> Result<NegotiatedCompression, Error> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let status = response.parse(bytes)?;
    if !status.is_complete() {
        return Err(Error::NoUpgrade);
    }

    // the status line has to be exactly HTTP/1.1 101
    if response.version != Some(1) || response.code != Some(101) {
        return Err(Error::NoUpgrade);
    }

    let upgrade = find_header(&response, "Upgrade").ok_or(Error::NoUpgradeHeaderPresent)?;
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }

    let connection =
        find_header(&response, "Connection").ok_or(Error::NoConnectionHeaderPresent)?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(Error::NoConnectionHeaderPresent);
    }

    let accept =
        find_header(&response, "Sec-WebSocket-Accept").ok_or(Error::InvalidAcceptKey)?;
    let expected = generate_websocket_accept_value(key);
    if !accept_keys_match(&expected, accept.trim()) {
        return Err(Error::InvalidAcceptKey);
    }

    match find_header(&response, "Sec-WebSocket-Extensions") {
        Some(value) => parse_server_extensions(value, compression_offered),
        None => Ok(NegotiatedCompression::default()),
    }
}

fn find_header<'b>(response: &httparse::Response<'_, 'b>, name: &str) -> Option<&'b str> {
    response
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .and_then(|header| std::str::from_utf8(header.value).ok())
}
