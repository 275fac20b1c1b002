use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::random;
use sha1::{Digest, Sha1};
use std::future::Future;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

pub(crate) const UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

pub(crate) fn generate_websocket_key() -> String {
    // thread rng is a CSPRNG, which the key is required to come from
    let random_bytes: [u8; 16] = random();
    BASE64_STANDARD.encode(random_bytes)
}

/// Compares the server's accept value against the expected one without
/// leaking the mismatch position through timing.
pub(crate) fn accept_keys_match(expected: &str, received: &str) -> bool {
    expected.as_bytes().ct_eq(received.as_bytes()).into()
}

/// Races a fallible future against the cancellation token. The token is
/// polled first, so a pending cancellation wins over a ready operation.
pub(crate) async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}
