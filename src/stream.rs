use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// The duplex transport under the client: either a bare TCP stream or one
/// wrapped in TLS. The rest of the crate only sees read/write/shutdown plus
/// the "was it established as TLS?" bit.
pub enum FeedFlowStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl FeedFlowStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, FeedFlowStream::Secure(_))
    }
}

impl AsyncRead for FeedFlowStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FeedFlowStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            FeedFlowStream::Secure(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FeedFlowStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FeedFlowStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            FeedFlowStream::Secure(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FeedFlowStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            FeedFlowStream::Secure(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FeedFlowStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            FeedFlowStream::Secure(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
