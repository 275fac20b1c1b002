//! Low-allocation async WebSockets client for the Tokio stack.
//!
//! This library implements the client side of the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! plus inbound `permessage-deflate` decompression
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)), aimed at
//! latency-sensitive consumers of streaming feeds such as market data.
//! Receive buffers are rented from a process-wide pool and reused between
//! messages, so a steady-state receive performs no heap allocation; the
//! payload handed back by [`client::WsClient::receive`] is a borrowed view
//! into those buffers, valid until the next receive.
//!
//! Connecting is done through [`handshake::connect_async`], which performs
//! the TCP connect (optionally tunnelled through an HTTP proxy), the TLS
//! establishment for `wss` URLs, and the HTTP/1.1 upgrade with accept-key
//! verification and compression negotiation.

pub mod client;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod options;

mod inflate;
mod pool;
mod read;
mod request;
mod stream;
#[cfg(test)]
mod tests;
mod utils;
mod write;
