use crate::error::Error;
use crate::frame::MAX_CONTROL_PAYLOAD;
use std::time::Duration;

/// Outbound proxy settings. When present, the TCP connection is made to the
/// proxy and the target is reached through an HTTP CONNECT tunnel.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Everything the client can be tuned with. Supplied once at connect time,
/// immutable afterwards.
///
/// The buffer sizes are initial capacities: the assemblers grow by doubling
/// through the buffer pool when a message outgrows them, so undersizing
/// costs copies, not correctness. `max_message_bytes` is the hard bound a
/// misbehaving server runs into.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Scratch region the frame reader chunks payloads through.
    pub read_buffer_size: usize,
    /// Scratch region outbound payloads are masked into.
    pub write_buffer_size: usize,
    /// Initial capacity of the data message assembler.
    pub message_buffer_size: usize,
    /// Initial capacity of the control frame assembler.
    pub control_buffer_size: usize,
    /// Initial capacity of the inflater output buffer.
    pub inflate_buffer_size: usize,
    /// Upper bound on the HTTP upgrade (and proxy CONNECT) response.
    pub handshake_buffer_size: usize,
    /// Frames or assembled messages larger than this fail the connection.
    pub max_message_bytes: usize,
    /// Per RFC 6455 §5.1 a server must never mask; leave this on unless
    /// debugging a permissive peer.
    pub reject_masked_server_frames: bool,
    /// Reply to incoming Pings automatically from the receive path.
    pub auto_pong_on_ping: bool,
    /// Offer permessage-deflate during the handshake.
    pub compression: bool,
    /// When false, offer `client_no_context_takeover`.
    pub client_context_takeover: bool,
    /// When false, offer `server_no_context_takeover`.
    pub server_context_takeover: bool,
    /// `client_max_window_bits` offer, 8..=15.
    pub client_max_window_bits: Option<u8>,
    /// `server_max_window_bits` offer, 8..=15.
    pub server_max_window_bits: Option<u8>,
    pub proxy: Option<ProxyOptions>,
    /// When set, a background task pings the server on this period.
    pub ping_interval: Option<Duration>,
    /// Payload carried by keep-alive pings, at most 125 bytes.
    pub ping_payload: Vec<u8>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            message_buffer_size: 64 * 1024,
            control_buffer_size: 256,
            inflate_buffer_size: 64 * 1024,
            handshake_buffer_size: 16 * 1024,
            max_message_bytes: 64 << 20,
            reject_masked_server_frames: true,
            auto_pong_on_ping: true,
            compression: false,
            client_context_takeover: true,
            server_context_takeover: true,
            client_max_window_bits: None,
            server_max_window_bits: None,
            proxy: None,
            ping_interval: None,
            ping_payload: Vec::new(),
        }
    }
}

impl ClientOptions {
    /// Validates the option set once, before any I/O happens. Everything
    /// rejected here is a configuration error; nothing past this point
    /// re-checks these invariants.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        for (size, name) in [
            (self.read_buffer_size, "read_buffer_size"),
            (self.write_buffer_size, "write_buffer_size"),
            (self.message_buffer_size, "message_buffer_size"),
            (self.control_buffer_size, "control_buffer_size"),
            (self.inflate_buffer_size, "inflate_buffer_size"),
            (self.handshake_buffer_size, "handshake_buffer_size"),
        ] {
            if size == 0 {
                return Err(Error::ZeroBufferSize(name));
            }
        }

        for bits in [self.client_max_window_bits, self.server_max_window_bits]
            .into_iter()
            .flatten()
        {
            if !(8..=15).contains(&bits) {
                return Err(Error::InvalidMaxWindowBits);
            }
        }

        if let Some(proxy) = &self.proxy {
            if proxy.port == 0 {
                return Err(Error::InvalidProxyPort);
            }
        }

        if let Some(interval) = self.ping_interval {
            if interval.is_zero() {
                return Err(Error::ZeroPingInterval);
            }
        }
        if self.ping_payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::PingPayloadTooLarge(self.ping_payload.len()));
        }

        Ok(())
    }
}
