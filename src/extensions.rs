use crate::error::Error;
use crate::options::ClientOptions;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// The compression parameter set the server answered the offer with.
/// Computed once during the handshake, immutable for the connection.
///
/// A missing `*_max_window_bits` parameter means the peer uses the full
/// 15-bit window, so `None` and `Some(15)` are equivalent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedCompression {
    pub enabled: bool,
    /// The server holds this client to resetting its deflate context per
    /// message. Only relevant to outbound compression, which this client
    /// does not do; kept because the handshake carries it.
    pub client_no_context_takeover: bool,
    /// The server resets its own context per message, so the inflater must
    /// reset before each inbound message too.
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

/// Renders the client's `Sec-WebSocket-Extensions` offer, or `None` when
/// compression is off. Window-bit values are validated before anything is
/// put on the wire.
pub(crate) fn render_offer(options: &ClientOptions) -> Result<Option<String>, Error> {
    if !options.compression {
        return Ok(None);
    }

    let mut offer = String::from(PERMESSAGE_DEFLATE);
    if !options.client_context_takeover {
        offer.push_str("; ");
        offer.push_str(CLIENT_NO_CONTEXT_TAKEOVER);
    }
    if !options.server_context_takeover {
        offer.push_str("; ");
        offer.push_str(SERVER_NO_CONTEXT_TAKEOVER);
    }
    if let Some(bits) = options.client_max_window_bits {
        if !(8..=15).contains(&bits) {
            return Err(Error::InvalidMaxWindowBits);
        }
        offer.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, bits));
    }
    if let Some(bits) = options.server_max_window_bits {
        if !(8..=15).contains(&bits) {
            return Err(Error::InvalidMaxWindowBits);
        }
        offer.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, bits));
    }

    Ok(Some(offer))
}

/// Parses the server's `Sec-WebSocket-Extensions` response header.
///
/// The header may list several extensions separated by commas; only the
/// `permessage-deflate` token matters here. Parameters the RFC doesn't
/// define are ignored, but the extension still counts as enabled with
/// whatever the server chose. A server that selects compression when the
/// client never offered it fails the handshake.
pub(crate) fn parse_server_extensions(
    header_value: &str,
    offered: bool,
) -> Result<NegotiatedCompression, Error> {
    let token = header_value.split(',').find(|token| {
        token
            .split(';')
            .next()
            .map(|name| name.trim().eq_ignore_ascii_case(PERMESSAGE_DEFLATE))
            .unwrap_or(false)
    });

    let token = match token {
        Some(token) => token,
        None => return Ok(NegotiatedCompression::default()),
    };
    if !offered {
        return Err(Error::UnsolicitedCompression);
    }

    let mut negotiated = NegotiatedCompression {
        enabled: true,
        ..NegotiatedCompression::default()
    };

    for param in token.split(';').skip(1) {
        let param = param.trim();
        if param.starts_with(CLIENT_NO_CONTEXT_TAKEOVER) {
            negotiated.client_no_context_takeover = true;
        } else if param.starts_with(SERVER_NO_CONTEXT_TAKEOVER) {
            negotiated.server_no_context_takeover = true;
        } else if param.starts_with(CLIENT_MAX_WINDOW_BITS) {
            negotiated.client_max_window_bits = parse_window_bits(param);
        } else if param.starts_with(SERVER_MAX_WINDOW_BITS) {
            negotiated.server_max_window_bits = parse_window_bits(param);
        }
        // unknown parameters are ignored per the RFC
    }

    Ok(negotiated)
}

// A bare parameter without `=` means the default 15-bit window.
fn parse_window_bits(param: &str) -> Option<u8> {
    if !param.contains('=') {
        return Some(15);
    }
    param
        .split('=')
        .last()
        .and_then(|value| value.trim().trim_matches('"').parse::<u8>().ok())
}
