use crate::error::Error;
use crate::frame::OpCode;
use crate::options::ClientOptions;
use crate::pool::PooledBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Per-frame serializer. Frames sent from the client must always be masked,
/// so the payload is copied chunk-by-chunk into a rented scratch region and
/// XORed there; the caller's buffer is never mutated.
pub(crate) struct FrameWriter<W> {
    write_half: W,
    scratch: PooledBuf,
    poisoned: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(write_half: W, options: &ClientOptions) -> Self {
        Self {
            write_half,
            scratch: PooledBuf::acquire(options.write_buffer_size),
            poisoned: false,
        }
    }

    /// True once a frame emission was interrupted partway: the wire may no
    /// longer be at a frame boundary and the connection must be aborted.
    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    /// Emits one complete frame: header (with a fresh mask key from the
    /// CSPRNG), then the masked payload. Cancellation before the first byte
    /// fails cleanly; once emission started, cancellation or I/O failure
    /// leaves the writer poisoned.
    pub async fn write_frame(
        &mut self,
        final_fragment: bool,
        opcode: OpCode,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mask: [u8; 4] = rand::random();
        let payload_len = payload.len();

        // At most 14 header bytes: 2 fixed, 8 extended length, 4 mask key.
        // The mask bit is always set, the client side must mask.
        let mut header = [0u8; 14];
        header[0] = (final_fragment as u8) << 7 | opcode.as_u8();
        let mut header_len = 2;
        if payload_len <= 125 {
            header[1] = 0b1000_0000 | payload_len as u8;
        } else if payload_len <= 65535 {
            header[1] = 0b1000_0000 | 126;
            header[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
            header_len = 4;
        } else {
            header[1] = 0b1000_0000 | 127;
            header[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
            header_len = 10;
        }
        header[header_len..header_len + 4].copy_from_slice(&mask);
        header_len += 4;

        self.poisoned = true;
        emit(&mut self.write_half, &header[..header_len], cancel).await?;

        // Copy into the scratch region, mask in place, emit. The XOR index
        // is the running offset within the whole payload.
        let mut offset = 0;
        while offset < payload_len {
            let take = (payload_len - offset).min(self.scratch.len());
            self.scratch[..take].copy_from_slice(&payload[offset..offset + take]);
            for (i, byte) in self.scratch[..take].iter_mut().enumerate() {
                *byte ^= mask[(offset + i) % 4];
            }
            emit(&mut self.write_half, &self.scratch[..take], cancel).await?;
            offset += take;
        }

        emit_flush(&mut self.write_half, cancel).await?;
        self.poisoned = false;

        Ok(())
    }

    /// Half-closes the transport's write side. Used on dispose; errors are
    /// the caller's to ignore.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.write_half.shutdown().await?;
        Ok(())
    }
}

async fn emit<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tokio::select! {
        res = write_half.write_all(bytes) => {
            res?;
            Ok(())
        }
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

async fn emit_flush<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tokio::select! {
        res = write_half.flush() => {
            res?;
            Ok(())
        }
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
