use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use url::ParseError;

/// Coarse classification of every error the client can produce.
///
/// Callers that don't care about the precise variant can match on
/// `Error::kind()` instead: configuration and usage errors are reported
/// synchronously, protocol and transport errors surface through the active
/// `receive` or `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An invalid option was supplied at construction or connect time.
    Configuration,
    /// A call was made in the wrong state (concurrent receive, send after close).
    Usage,
    /// The peer (or this client, on the wire) violated RFC 6455 or RFC 7692.
    Protocol,
    /// The underlying duplex stream failed (I/O, TLS, DNS, connect refused).
    Transport,
    /// A cancellation signal fired.
    Cancelled,
    /// Compression was requested, but the inflate backend failed its self-check.
    CompressionUnavailable,
}

#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    #[error("ping payload of `{0}` bytes exceeds the 125 byte control frame limit")]
    PingPayloadTooLarge(usize),

    #[error("keep-alive ping interval must be positive")]
    ZeroPingInterval,

    #[error("proxy port must be non-zero")]
    InvalidProxyPort,

    #[error("buffer size option `{0}` must be non-zero")]
    ZeroBufferSize(&'static str),

    #[error("close code `{0}` is reserved or out of the sendable range")]
    InvalidCloseCode(u16),

    #[error("close reason of `{0}` bytes does not fit a control frame with its code")]
    CloseReasonTooLong(usize),

    #[error("close reason requires a close code")]
    CloseReasonWithoutCode,

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    // Usage errors
    #[error("a receive is already in progress on this client")]
    ReceiveInProgress,

    #[error("the client is closing, no further frames can be sent")]
    ClosingInProgress,

    #[error("the connection is already closed")]
    ConnectionClosed,

    #[error("messages can only be sent with the Text or Binary opcode")]
    InvalidMessageOpcode,

    // Protocol errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("received a masked frame from the server")]
    MaskedFrameFromServer,

    #[error("connection closed in the middle of a frame")]
    ConnectionTruncated,

    #[error("close frame with a 1-byte payload")]
    InvalidCloseFramePayload,

    #[error("{source}")]
    InvalidUtf8 {
        #[from]
        source: Utf8Error,
    },

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Upgrade: websocket header missing in the response")]
    NoUpgradeHeaderPresent,

    #[error("Connection: Upgrade header missing in the response")]
    NoConnectionHeaderPresent,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("handshake response exceeded the handshake buffer size")]
    HandshakeTooLarge,

    #[error("proxy refused the tunnel with status `{0}`")]
    ProxyConnectFailed(u16),

    #[error("server selected permessage-deflate but it was never offered")]
    UnsolicitedCompression,

    #[error("inflate failed on a compressed message")]
    DecompressionFailed,

    // Transport errors
    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("hostname did not resolve to any address")]
    DnsResolveFailed,

    // Cancellation
    #[error("the operation was cancelled")]
    Cancelled,

    // Compression availability
    #[error("compression enabled but the inflate backend is unavailable")]
    CompressionUnavailable,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMaxWindowBits
            | Error::PingPayloadTooLarge(_)
            | Error::ZeroPingInterval
            | Error::InvalidProxyPort
            | Error::ZeroBufferSize(_)
            | Error::InvalidCloseCode(_)
            | Error::CloseReasonTooLong(_)
            | Error::CloseReasonWithoutCode
            | Error::InvalidSchemeURL
            | Error::URLNoHost
            | Error::URLParseError { .. } => ErrorKind::Configuration,

            Error::ReceiveInProgress
            | Error::ClosingInProgress
            | Error::ConnectionClosed
            | Error::InvalidMessageOpcode => ErrorKind::Usage,

            Error::RSVNotZero
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::MaxMessageSize
            | Error::InvalidOpcode
            | Error::InvalidContinuationFrame
            | Error::InvalidFrameFragmentation
            | Error::MaskedFrameFromServer
            | Error::ConnectionTruncated
            | Error::InvalidCloseFramePayload
            | Error::InvalidUtf8 { .. }
            | Error::HttpParseError { .. }
            | Error::NoUpgrade
            | Error::NoUpgradeHeaderPresent
            | Error::NoConnectionHeaderPresent
            | Error::InvalidAcceptKey
            | Error::HandshakeTooLarge
            | Error::ProxyConnectFailed(_)
            | Error::UnsolicitedCompression
            | Error::DecompressionFailed => ErrorKind::Protocol,

            Error::IOError { .. } | Error::DomainError { .. } | Error::DnsResolveFailed => {
                ErrorKind::Transport
            }

            Error::Cancelled => ErrorKind::Cancelled,

            Error::CompressionUnavailable => ErrorKind::CompressionUnavailable,
        }
    }
}
