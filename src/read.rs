use crate::error::Error;
use crate::frame::{FrameHeader, OpCode, MAX_CONTROL_PAYLOAD};
use crate::options::ClientOptions;
use crate::pool::{Assembler, PooledBuf};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Per-frame parser over the established transport. Owns the rented scratch
/// region used for both header bytes and payload chunking, so a steady-state
/// receive never touches the allocator.
pub(crate) struct FrameReader<R> {
    read_half: R,
    scratch: PooledBuf,
    max_message_bytes: usize,
    reject_masked_frames: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(read_half: R, options: &ClientOptions) -> Self {
        Self {
            read_half,
            scratch: PooledBuf::acquire(options.read_buffer_size),
            max_message_bytes: options.max_message_bytes,
            reject_masked_frames: options.reject_masked_server_frames,
        }
    }

    /// Reads and validates one frame header. The payload is left on the
    /// wire; callers stream it out with [`read_payload`](Self::read_payload).
    pub async fn read_header(&mut self) -> Result<FrameHeader, Error> {
        let mut header = [0u8; 2];
        self.read_exact(&mut header).await?;

        // The first bit in the first byte tells us whether this frame is the
        // final fragment of a message, the last 4 bits carry the opcode.
        let final_fragment = (header[0] & 0b10000000) != 0;
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // RSV bits are only meaningful under a negotiated extension. RSV1
        // may be set by permessage-deflate on the first frame of a data
        // message, which only the message pipeline can judge, so it is
        // reported upward. RSV2 and RSV3 have no extension behind them and
        // fail the connection immediately.
        let rsv1 = (header[0] & 0b01000000) != 0;
        let rsv2 = (header[0] & 0b00100000) != 0;
        let rsv3 = (header[0] & 0b00010000) != 0;
        if rsv2 || rsv3 {
            return Err(Error::RSVNotZero);
        }

        // Control opcodes (ping, pong, close) can't be fragmented
        if !final_fragment && opcode.is_control() {
            Err(Error::ControlFramesFragmented)?;
        }

        // Mask bit, then the 7-bit short length
        let masked = (header[1] & 0b10000000) != 0;
        let mut payload_len = (header[1] & 0b01111111) as usize;

        // Control frames are only allowed a payload up to and including 125
        // octets, which also rules out the extended length encodings
        if payload_len > MAX_CONTROL_PAYLOAD && opcode.is_control() {
            Err(Error::ControlFramePayloadSize)?;
        }

        if payload_len == 126 {
            let mut be_bytes = [0u8; 2];
            self.read_exact(&mut be_bytes).await?;
            payload_len = u16::from_be_bytes(be_bytes) as usize;
        } else if payload_len == 127 {
            let mut be_bytes = [0u8; 8];
            self.read_exact(&mut be_bytes).await?;
            payload_len = u64::from_be_bytes(be_bytes) as usize;
        }

        if payload_len > self.max_message_bytes {
            Err(Error::MaxMessageSize)?;
        }

        // Frames sent from server to client are not masked; a masked one is
        // a protocol violation unless the caller opted into permissiveness
        let mask_key = if masked {
            if self.reject_masked_frames {
                Err(Error::MaskedFrameFromServer)?;
            }
            let mut mask = [0u8; 4];
            self.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        Ok(FrameHeader {
            final_fragment,
            rsv1,
            opcode,
            masked,
            payload_len,
            mask_key,
        })
    }

    /// Streams the frame's payload into `out`, one scratch-sized chunk at a
    /// time, unmasking in place when the header carried a mask key. The XOR
    /// index is the running offset within the whole payload, not the chunk.
    pub async fn read_payload(
        &mut self,
        header: &FrameHeader,
        out: &mut Assembler,
    ) -> Result<(), Error> {
        let mut remaining = header.payload_len;
        let mut offset = 0usize;

        while remaining > 0 {
            let take = remaining.min(self.scratch.len());
            let n = self.read_half.read(&mut self.scratch[..take]).await?;
            if n == 0 {
                return Err(Error::ConnectionTruncated);
            }

            if let Some(mask) = header.mask_key {
                for (i, byte) in self.scratch[..n].iter_mut().enumerate() {
                    *byte ^= mask[(offset + i) % 4];
                }
            }

            out.append(&self.scratch[..n]);
            offset += n;
            remaining -= n;
        }

        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.read_half.read_exact(buf).await.map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                Error::ConnectionTruncated
            } else {
                err.into()
            }
        })?;
        Ok(())
    }
}
