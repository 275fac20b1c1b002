use crate::client::{ClientState, Received};
use crate::error::{Error, ErrorKind};
use crate::extensions::parse_server_extensions;
use crate::extensions::render_offer;
use crate::frame::{validate_close_code, OpCode};
use crate::handshake::{connect_async, connect_async_with_config};
use crate::inflate::Inflater;
use crate::options::{ClientOptions, ProxyOptions};
use crate::pool::Assembler;
use crate::read::FrameReader;
use crate::request::{build_connect_request, build_upgrade_request, parse_uri};
use crate::utils::generate_websocket_accept_value;
use crate::write::FrameWriter;
use flate2::{Compress, Compression, FlushCompress};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---- scripted server support ----------------------------------------------

/// Binds an ephemeral port and serves exactly one connection with the given
/// script. The handler's return value comes back through the join handle.
async fn spawn_server<T, F, Fut>(handler: F) -> (u16, JoinHandle<T>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        handler(stream).await
    });
    (port, handle)
}

/// Answers the client's upgrade request with a valid 101, echoing the
/// extensions header when the script wants compression negotiated.
async fn perform_server_handshake(stream: &mut TcpStream, extensions: Option<&str>) {
    let request = read_until_headers_end(stream).await;
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("client request carries a key")
        .trim();

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        generate_websocket_accept_value(key)
    );
    if let Some(extensions) = extensions {
        response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", extensions));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await.unwrap();
}

async fn read_until_headers_end(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

struct ClientFrame {
    fin: bool,
    opcode: u8,
    // the 7-bit length field, to assert which length encoding was chosen
    len_marker: u8,
    payload: Vec<u8>,
}

/// Reads one frame sent by the client and unmasks it, asserting the
/// invariants every client frame must hold.
async fn read_client_frame(stream: &mut TcpStream) -> ClientFrame {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    assert_eq!(header[1] & 0x80, 0x80, "client frames must be masked");

    let len_marker = header[1] & 0x7F;
    let payload_len = match len_marker {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        short => short as usize,
    };

    let mut mask = [0u8; 4];
    stream.read_exact(&mut mask).await.unwrap();
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    ClientFrame {
        fin,
        opcode,
        len_marker,
        payload,
    }
}

/// Raw-deflates `data` with one sync flush and strips the `00 00 FF FF`
/// trailer, exactly the way a permessage-deflate sender would.
fn deflate_sync(data: &[u8]) -> Vec<u8> {
    let mut compressor = Compress::new_with_window_bits(Compression::default(), false, 15);
    let mut out = Vec::with_capacity(data.len() * 2 + 64);
    compressor
        .compress_vec(data, &mut out, FlushCompress::Sync)
        .unwrap();
    assert!(out.ends_with(&[0x00, 0x00, 0xFF, 0xFF]));
    out.truncate(out.len() - 4);
    out
}

fn ws_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}", port)
}

// ---- frame types -----------------------------------------------------------

#[test]
fn test_opcode() {
    let byte = 0x0;
    let res = OpCode::from(byte).unwrap();
    assert_eq!(res, OpCode::Continue);

    let opcode = OpCode::Text;
    assert_eq!(opcode.as_u8(), 0x1);

    assert!(OpCode::Close.is_control());
    assert!(!OpCode::Text.is_control());

    assert!(matches!(OpCode::from(0x3), Err(Error::InvalidOpcode)));
}

#[test]
fn test_close_code_validation() {
    for code in [1000, 1001, 1004, 1011, 3000, 4999] {
        assert!(validate_close_code(code).is_ok(), "{code} should be valid");
    }
    for code in [999, 1005, 1006, 1015, 1016, 2999, 5000] {
        assert!(validate_close_code(code).is_err(), "{code} should be rejected");
    }
}

// ---- uri / request building ------------------------------------------------

#[test]
fn test_parse_uri_valid() {
    let parts = parse_uri("ws://localhost:8080/feed?symbols=all").unwrap();
    assert_eq!(parts.host, "localhost");
    assert_eq!(parts.port, 8080);
    assert_eq!(parts.request_path, "/feed?symbols=all");
    assert!(!parts.use_tls);
}

#[test]
fn test_parse_uri_default_ports() {
    assert_eq!(parse_uri("ws://localhost").unwrap().port, 80);
    let secure = parse_uri("wss://example.com/stream").unwrap();
    assert_eq!(secure.port, 443);
    assert!(secure.use_tls);
}

#[test]
fn test_parse_uri_invalid_scheme() {
    assert!(matches!(
        parse_uri("ftp://localhost:8080"),
        Err(Error::InvalidSchemeURL)
    ));
}

#[test]
fn test_parse_uri_no_host() {
    assert!(parse_uri("ws://:8080").is_err());
}

#[test]
fn test_build_upgrade_request() {
    let parts = parse_uri("ws://localhost:8080").unwrap();
    let request = build_upgrade_request(&parts, "dGhlIHNhbXBsZSBub25jZQ==", None);
    assert!(request.starts_with("GET / HTTP/1.1\r\n"));
    assert!(request.contains("Host: localhost:8080\r\n"));
    assert!(request.contains("Upgrade: websocket\r\n"));
    assert!(request.contains("Connection: Upgrade\r\n"));
    assert!(request.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
    assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(!request.contains("Sec-WebSocket-Extensions"));
    assert!(request.ends_with("\r\n\r\n"));
}

#[test]
fn test_build_upgrade_request_with_offer() {
    let parts = parse_uri("ws://localhost:8080").unwrap();
    let request = build_upgrade_request(&parts, "a2V5", Some("permessage-deflate"));
    assert!(request.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
}

#[test]
fn test_build_connect_request() {
    let parts = parse_uri("wss://feed.example.com").unwrap();
    let request = build_connect_request(&parts, Some("user"), Some("secret"));
    assert!(request.starts_with("CONNECT feed.example.com:443 HTTP/1.1\r\n"));
    assert!(request.contains("Host: feed.example.com:443\r\n"));
    assert!(request.contains("Proxy-Connection: Keep-Alive\r\n"));
    // base64("user:secret")
    assert!(request.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));

    let anonymous = build_connect_request(&parts, None, None);
    assert!(!anonymous.contains("Proxy-Authorization"));
}

// ---- options ---------------------------------------------------------------

#[test]
fn test_options_validation() {
    assert!(ClientOptions::default().validate().is_ok());

    let mut options = ClientOptions::default();
    options.read_buffer_size = 0;
    assert!(matches!(options.validate(), Err(Error::ZeroBufferSize(_))));

    let mut options = ClientOptions::default();
    options.server_max_window_bits = Some(16);
    assert!(matches!(
        options.validate(),
        Err(Error::InvalidMaxWindowBits)
    ));

    let mut options = ClientOptions::default();
    options.ping_payload = vec![0; 126];
    assert!(matches!(
        options.validate(),
        Err(Error::PingPayloadTooLarge(126))
    ));

    let mut options = ClientOptions::default();
    options.ping_interval = Some(Duration::ZERO);
    assert!(matches!(options.validate(), Err(Error::ZeroPingInterval)));

    let mut options = ClientOptions::default();
    options.proxy = Some(ProxyOptions {
        host: "proxy".into(),
        port: 0,
        username: None,
        password: None,
    });
    assert!(matches!(options.validate(), Err(Error::InvalidProxyPort)));
}

// ---- compression negotiation ----------------------------------------------

#[test]
fn test_render_offer() {
    let options = ClientOptions::default();
    assert_eq!(render_offer(&options).unwrap(), None);

    let mut options = ClientOptions::default();
    options.compression = true;
    assert_eq!(
        render_offer(&options).unwrap().unwrap(),
        "permessage-deflate"
    );

    options.client_context_takeover = false;
    options.server_context_takeover = false;
    options.client_max_window_bits = Some(12);
    options.server_max_window_bits = Some(10);
    assert_eq!(
        render_offer(&options).unwrap().unwrap(),
        "permessage-deflate; client_no_context_takeover; server_no_context_takeover; client_max_window_bits=12; server_max_window_bits=10"
    );

    options.server_max_window_bits = Some(7);
    assert!(matches!(
        render_offer(&options),
        Err(Error::InvalidMaxWindowBits)
    ));
}

#[test]
fn test_parse_server_extensions() {
    let negotiated = parse_server_extensions("permessage-deflate", true).unwrap();
    assert!(negotiated.enabled);
    assert!(!negotiated.server_no_context_takeover);
    assert_eq!(negotiated.server_max_window_bits, None);

    let negotiated = parse_server_extensions(
        "permessage-deflate; server_no_context_takeover; server_max_window_bits=10",
        true,
    )
    .unwrap();
    assert!(negotiated.server_no_context_takeover);
    assert_eq!(negotiated.server_max_window_bits, Some(10));

    // a bare max_window_bits parameter means the default 15
    let negotiated =
        parse_server_extensions("permessage-deflate; client_max_window_bits", true).unwrap();
    assert_eq!(negotiated.client_max_window_bits, Some(15));

    // unknown parameters and other extensions are ignored
    let negotiated =
        parse_server_extensions("x-webkit-foo, permessage-deflate; some_future_param=1", true)
            .unwrap();
    assert!(negotiated.enabled);

    // empty header or no permessage-deflate token: not negotiated
    assert!(!parse_server_extensions("", true).unwrap().enabled);
    assert!(!parse_server_extensions("x-foo", true).unwrap().enabled);

    // selecting compression that was never offered fails the handshake
    assert!(matches!(
        parse_server_extensions("permessage-deflate", false),
        Err(Error::UnsolicitedCompression)
    ));
}

#[test]
fn test_offer_parse_round_trip() {
    let mut options = ClientOptions::default();
    options.compression = true;
    options.server_context_takeover = false;
    options.client_max_window_bits = Some(11);

    let offer = render_offer(&options).unwrap().unwrap();
    let negotiated = parse_server_extensions(&offer, true).unwrap();
    assert!(negotiated.enabled);
    assert_eq!(
        negotiated.client_no_context_takeover,
        !options.client_context_takeover
    );
    assert_eq!(
        negotiated.server_no_context_takeover,
        !options.server_context_takeover
    );
    assert_eq!(negotiated.client_max_window_bits, options.client_max_window_bits);
    assert_eq!(negotiated.server_max_window_bits, options.server_max_window_bits);
}

// ---- pool / assembler ------------------------------------------------------

#[test]
fn test_assembler_append_and_reset() {
    let mut assembler = Assembler::with_capacity(4);
    assembler.append(b"ab");
    assembler.append(b"cd");
    // growth across the initial capacity keeps the accumulated prefix
    assembler.append(b"efghij");
    assert_eq!(assembler.as_slice(), b"abcdefghij");
    assert_eq!(assembler.len(), 10);

    assembler.reset();
    assert_eq!(assembler.len(), 0);
    assert!(assembler.as_slice().is_empty());

    assembler.append(b"xy");
    assert_eq!(assembler.as_slice(), b"xy");
}

#[test]
fn test_assembler_large_growth() {
    let mut assembler = Assembler::with_capacity(1);
    let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    for chunk in data.chunks(97) {
        assembler.append(chunk);
    }
    assert_eq!(assembler.as_slice(), &data[..]);
}

// ---- inflater --------------------------------------------------------------

#[test]
fn test_inflater_round_trip() {
    let mut inflater = Inflater::new(false, None, 64);
    let compressed = deflate_sync(b"hello inflater");
    assert_eq!(inflater.inflate(&compressed).unwrap(), b"hello inflater");
}

#[test]
fn test_inflater_output_growth() {
    // output starts far smaller than the message and has to double its way up
    let mut inflater = Inflater::new(false, None, 8);
    let data: Vec<u8> = (0..50_000).map(|i| (i % 7) as u8).collect();
    let compressed = deflate_sync(&data);
    assert_eq!(inflater.inflate(&compressed).unwrap(), &data[..]);
}

#[test]
fn test_inflater_no_context_takeover_is_stateless() {
    // with per-message resets the same compressed bytes always inflate the
    // same way, regardless of what came before
    let mut inflater = Inflater::new(true, None, 64);
    let compressed = deflate_sync(b"repeated message");
    let first = inflater.inflate(&compressed).unwrap().to_vec();
    inflater.inflate(&deflate_sync(b"some other message")).unwrap();
    let again = inflater.inflate(&compressed).unwrap().to_vec();
    assert_eq!(first, again);
    assert_eq!(first, b"repeated message");
}

#[test]
fn test_inflater_context_takeover() {
    // the sender keeps its window between messages, so the receiver must too
    let mut compressor = Compress::new_with_window_bits(Compression::default(), false, 15);
    let mut first = Vec::with_capacity(256);
    compressor
        .compress_vec(b"market data tick", &mut first, FlushCompress::Sync)
        .unwrap();
    first.truncate(first.len() - 4);
    let mut second = Vec::with_capacity(256);
    compressor
        .compress_vec(b"market data tick", &mut second, FlushCompress::Sync)
        .unwrap();
    second.truncate(second.len() - 4);

    let mut inflater = Inflater::new(false, None, 64);
    assert_eq!(inflater.inflate(&first).unwrap(), b"market data tick");
    assert_eq!(inflater.inflate(&second).unwrap(), b"market data tick");
}

#[test]
fn test_inflater_rejects_garbage() {
    let mut inflater = Inflater::new(true, None, 64);
    assert!(inflater.inflate(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
}

// ---- frame reader / writer -------------------------------------------------

fn frame_options() -> ClientOptions {
    ClientOptions {
        read_buffer_size: 64,
        write_buffer_size: 64,
        ..ClientOptions::default()
    }
}

#[tokio::test]
async fn test_reader_parses_unmasked_frame() {
    let (mut server, client) = tokio::io::duplex(1024);
    server.write_all(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']).await.unwrap();

    let options = frame_options();
    let mut reader = FrameReader::new(client, &options);
    let header = reader.read_header().await.unwrap();
    assert!(header.final_fragment);
    assert!(!header.rsv1);
    assert_eq!(header.opcode, OpCode::Text);
    assert_eq!(header.payload_len, 5);
    assert_eq!(header.mask_key, None);

    let mut out = Assembler::with_capacity(16);
    reader.read_payload(&header, &mut out).await.unwrap();
    assert_eq!(out.as_slice(), b"hello");
}

#[tokio::test]
async fn test_reader_rejects_rsv2() {
    let (mut server, client) = tokio::io::duplex(64);
    server.write_all(&[0xA1, 0x00]).await.unwrap();
    let options = frame_options();
    let mut reader = FrameReader::new(client, &options);
    assert!(matches!(reader.read_header().await, Err(Error::RSVNotZero)));
}

#[tokio::test]
async fn test_reader_rejects_fragmented_control() {
    let (mut server, client) = tokio::io::duplex(64);
    // ping with fin = 0
    server.write_all(&[0x09, 0x00]).await.unwrap();
    let options = frame_options();
    let mut reader = FrameReader::new(client, &options);
    assert!(matches!(
        reader.read_header().await,
        Err(Error::ControlFramesFragmented)
    ));
}

#[tokio::test]
async fn test_reader_rejects_oversized_control() {
    let (mut server, client) = tokio::io::duplex(64);
    server.write_all(&[0x89, 126, 0x00, 0x80]).await.unwrap();
    let options = frame_options();
    let mut reader = FrameReader::new(client, &options);
    assert!(matches!(
        reader.read_header().await,
        Err(Error::ControlFramePayloadSize)
    ));
}

#[tokio::test]
async fn test_reader_rejects_masked_server_frame() {
    let (mut server, client) = tokio::io::duplex(64);
    server
        .write_all(&[0x81, 0x81, 1, 2, 3, 4, 0xFF])
        .await
        .unwrap();
    let options = frame_options();
    let mut reader = FrameReader::new(client, &options);
    assert!(matches!(
        reader.read_header().await,
        Err(Error::MaskedFrameFromServer)
    ));
}

#[tokio::test]
async fn test_reader_enforces_max_message_bytes() {
    let (mut server, client) = tokio::io::duplex(64);
    // 70_000 byte frame against a 65_536 limit: rejected on the header,
    // before any payload is read
    server.write_all(&[0x82, 127]).await.unwrap();
    server.write_all(&70_000u64.to_be_bytes()).await.unwrap();
    let options = ClientOptions {
        max_message_bytes: 65_536,
        ..frame_options()
    };
    let mut reader = FrameReader::new(client, &options);
    assert!(matches!(
        reader.read_header().await,
        Err(Error::MaxMessageSize)
    ));
}

#[tokio::test]
async fn test_reader_truncated_payload() {
    let (mut server, client) = tokio::io::duplex(64);
    server.write_all(&[0x82, 0x05, 1, 2]).await.unwrap();
    drop(server);
    let options = frame_options();
    let mut reader = FrameReader::new(client, &options);
    let header = reader.read_header().await.unwrap();
    let mut out = Assembler::with_capacity(16);
    assert!(matches!(
        reader.read_payload(&header, &mut out).await,
        Err(Error::ConnectionTruncated)
    ));
}

#[tokio::test]
async fn test_writer_masks_payload() {
    let (client, mut server) = tokio::io::duplex(1024);
    let options = frame_options();
    let mut writer = FrameWriter::new(client, &options);
    let cancel = CancellationToken::new();

    // 200 bytes forces the two-byte extended length, and spans several
    // scratch chunks so the running mask offset is exercised
    let payload: Vec<u8> = (0..200).map(|i| (i % 97) as u8).collect();
    writer
        .write_frame(true, OpCode::Binary, &payload, &cancel)
        .await
        .unwrap();
    assert!(!writer.poisoned());

    let mut header = [0u8; 2];
    server.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x82);
    assert_eq!(header[1], 0x80 | 126);
    let mut extended = [0u8; 2];
    server.read_exact(&mut extended).await.unwrap();
    assert_eq!(u16::from_be_bytes(extended), 200);

    let mut mask = [0u8; 4];
    server.read_exact(&mut mask).await.unwrap();
    let mut wire = vec![0u8; 200];
    server.read_exact(&mut wire).await.unwrap();
    for (i, byte) in wire.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    assert_eq!(wire, payload);
}

#[tokio::test]
async fn test_writer_cancelled_before_start_is_clean() {
    let (client, _server) = tokio::io::duplex(1024);
    let options = frame_options();
    let mut writer = FrameWriter::new(client, &options);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = writer.write_frame(true, OpCode::Binary, b"x", &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    // nothing was emitted, the wire is still at a frame boundary
    assert!(!writer.poisoned());
}

// ---- end-to-end scenarios --------------------------------------------------

#[tokio::test]
async fn test_receive_unfragmented_text() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        stream
            .write_all(&[0x81, 0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F])
            .await
            .unwrap();
        // hold the socket open until the client hangs up
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    assert_eq!(client.state(), ClientState::Open);
    assert!(!client.is_tls());
    assert!(!client.negotiated().enabled);

    match client.receive().await.unwrap() {
        Received::Message(message) => {
            assert_eq!(message.opcode(), OpCode::Text);
            assert_eq!(message.payload(), b"hello");
            assert_eq!(message.as_text().unwrap(), "hello");
        }
        Received::Close(_) => panic!("expected a message"),
    }

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_receive_fragmented_binary_with_interleaved_ping() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        // fragment A, then a ping in the middle, then the final fragment
        stream.write_all(&[0x02, 0x02, 0x01, 0x02]).await.unwrap();
        stream.write_all(&[0x89, 0x02, 0x70, 0x69]).await.unwrap();
        stream.write_all(&[0x80, 0x02, 0x03, 0x04]).await.unwrap();
        read_client_frame(&mut stream).await
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    match client.receive().await.unwrap() {
        Received::Message(message) => {
            assert_eq!(message.opcode(), OpCode::Binary);
            assert_eq!(message.payload(), &[0x01, 0x02, 0x03, 0x04]);
        }
        Received::Close(_) => panic!("expected a message"),
    }

    // the ping was answered from inside the receive path, payload echoed
    let pong = server.await.unwrap();
    assert!(pong.fin);
    assert_eq!(pong.opcode, 0xA);
    assert_eq!(pong.payload, vec![0x70, 0x69]);
}

#[tokio::test]
async fn test_receive_compressed_text() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, Some("permessage-deflate")).await;
        let compressed = deflate_sync(br#"{"a":1}"#);
        // fin = 1, rsv1 = 1, text
        let mut frame = vec![0xC1, compressed.len() as u8];
        frame.extend_from_slice(&compressed);
        stream.write_all(&frame).await.unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    })
    .await;

    let options = ClientOptions {
        compression: true,
        ..ClientOptions::default()
    };
    let client = connect_async_with_config(&ws_url(port), options, CancellationToken::new())
        .await
        .unwrap();
    assert!(client.negotiated().enabled);

    match client.receive().await.unwrap() {
        Received::Message(message) => {
            assert_eq!(message.opcode(), OpCode::Text);
            assert_eq!(message.payload(), br#"{"a":1}"#);
        }
        Received::Close(_) => panic!("expected a message"),
    }

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_remote_close_is_echoed() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        // close, code 1000, no reason
        stream.write_all(&[0x88, 0x02, 0x03, 0xE8]).await.unwrap();
        read_client_frame(&mut stream).await
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    match client.receive().await.unwrap() {
        Received::Close(frame) => {
            assert_eq!(frame.code, Some(1000));
            assert!(frame.reason.is_empty());
        }
        Received::Message(_) => panic!("expected the close"),
    }
    assert_eq!(client.state(), ClientState::Closed);

    // further receives are a usage error on a closed connection
    assert!(matches!(
        client.receive().await,
        Err(Error::ConnectionClosed)
    ));

    let echo = server.await.unwrap();
    assert_eq!(echo.opcode, 0x8);
    assert_eq!(echo.payload, vec![0x03, 0xE8]);
}

#[tokio::test]
async fn test_send_large_payload_single_frame() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        read_client_frame(&mut stream).await
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    client.send_binary(&payload).await.unwrap();

    let frame = server.await.unwrap();
    assert!(frame.fin, "large sends are not fragmented");
    assert_eq!(frame.opcode, 0x2);
    assert_eq!(frame.len_marker, 127, "200k needs the 8-byte length form");
    assert_eq!(frame.payload, payload);
}

#[tokio::test]
async fn test_send_medium_payload_uses_two_byte_length() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        read_client_frame(&mut stream).await
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    client.send_binary(&[0xAB; 300]).await.unwrap();

    let frame = server.await.unwrap();
    assert_eq!(frame.len_marker, 126);
    assert_eq!(frame.payload, vec![0xAB; 300]);
}

#[tokio::test]
async fn test_close_output_then_send_fails() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        read_client_frame(&mut stream).await
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    client.close_output(Some(1000), "bye").await.unwrap();
    assert_eq!(client.state(), ClientState::CloseSent);

    // the close is the last frame this client may emit
    let err = client.send_text("more").await.unwrap_err();
    assert!(matches!(err, Error::ClosingInProgress));
    assert_eq!(err.kind(), ErrorKind::Usage);

    let frame = server.await.unwrap();
    assert_eq!(frame.opcode, 0x8);
    assert_eq!(frame.payload, [&[0x03, 0xE8][..], b"bye"].concat());
}

#[tokio::test]
async fn test_close_output_validates_code() {
    let (port, _server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    assert!(matches!(
        client.close_output(Some(1005), "").await,
        Err(Error::InvalidCloseCode(1005))
    ));
    assert!(matches!(
        client.close_output(None, "reason without code").await,
        Err(Error::CloseReasonWithoutCode)
    ));
    let long_reason = "x".repeat(124);
    assert!(matches!(
        client.close_output(Some(1000), &long_reason).await,
        Err(Error::CloseReasonTooLong(124))
    ));
    // the client is still open, nothing was emitted
    assert_eq!(client.state(), ClientState::Open);
    client.close().await;
}

#[tokio::test]
async fn test_concurrent_receive_is_rejected() {
    let (port, _server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        // send nothing: the first receive stays parked on the socket
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    })
    .await;

    let client = Arc::new(connect_async(&ws_url(port)).await.unwrap());
    let receiver = Arc::clone(&client);
    let pending = tokio::spawn(async move {
        let _ = receiver.receive().await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        client.receive().await,
        Err(Error::ReceiveInProgress)
    ));

    pending.abort();
    client.close().await;
}

#[tokio::test]
async fn test_cancellation_fails_pending_operations() {
    let (port, _server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    })
    .await;

    let cancel = CancellationToken::new();
    let client =
        connect_async_with_config(&ws_url(port), ClientOptions::default(), cancel.clone())
            .await
            .unwrap();

    cancel.cancel();
    let err = client.receive().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let err = client.send_text("tick").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_keep_alive_pinger() {
    let (port, server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        read_client_frame(&mut stream).await
    })
    .await;

    let options = ClientOptions {
        ping_interval: Some(Duration::from_millis(20)),
        ping_payload: b"hb".to_vec(),
        ..ClientOptions::default()
    };
    let client = connect_async_with_config(&ws_url(port), options, CancellationToken::new())
        .await
        .unwrap();

    let ping = server.await.unwrap();
    assert_eq!(ping.opcode, 0x9);
    assert_eq!(ping.payload, b"hb");
    client.close().await;
}

#[tokio::test]
async fn test_protocol_error_aborts_client() {
    let (port, _server) = spawn_server(|mut stream| async move {
        perform_server_handshake(&mut stream, None).await;
        // a bare continuation frame outside any fragmented message
        stream.write_all(&[0x80, 0x01, 0x00]).await.unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    })
    .await;

    let client = connect_async(&ws_url(port)).await.unwrap();
    let err = client.receive().await.unwrap_err();
    assert!(matches!(err, Error::InvalidContinuationFrame));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(client.state(), ClientState::Aborted);

    // the transport is gone, nothing can be sent anymore
    assert!(client.send_text("tick").await.is_err());
}

// ---- handshake failures ----------------------------------------------------

#[tokio::test]
async fn test_handshake_rejects_bad_accept_key() {
    let (port, _server) = spawn_server(|mut stream| async move {
        let _ = read_until_headers_end(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n",
            )
            .await
            .unwrap();
    })
    .await;

    assert!(matches!(
        connect_async(&ws_url(port)).await,
        Err(Error::InvalidAcceptKey)
    ));
}

#[tokio::test]
async fn test_handshake_rejects_non_101() {
    let (port, _server) = spawn_server(|mut stream| async move {
        let _ = read_until_headers_end(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    })
    .await;

    assert!(matches!(
        connect_async(&ws_url(port)).await,
        Err(Error::NoUpgrade)
    ));
}

#[tokio::test]
async fn test_handshake_rejects_unsolicited_compression() {
    let (port, _server) = spawn_server(|mut stream| async move {
        // negotiate compression even though the client never offered it
        perform_server_handshake(&mut stream, Some("permessage-deflate")).await;
    })
    .await;

    assert!(matches!(
        connect_async(&ws_url(port)).await,
        Err(Error::UnsolicitedCompression)
    ));
}
