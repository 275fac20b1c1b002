use crate::error::Error;
use crate::pool::PooledBuf;
use flate2::{Decompress, FlushDecompress, Status};
use std::sync::OnceLock;

// RFC 7692 §7.2.2: the sender strips this from every message, the receiver
// appends it back before inflating.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Streaming raw-deflate decoder for inbound compressed messages, plus the
/// growable pooled region its output lands in.
///
/// One inflater serves the whole connection: unless the server negotiated
/// `server_no_context_takeover`, the sliding window carries over between
/// messages and resetting it would corrupt the stream.
pub(crate) struct Inflater {
    decompressor: Decompress,
    out: PooledBuf,
    written: usize,
    reset_context: bool,
}

impl Inflater {
    pub fn new(reset_context: bool, window_bits: Option<u8>, initial_capacity: usize) -> Self {
        // zlib rejects a raw-deflate window of 8 bits; decode 8-bit offers
        // with a 9-bit window, which covers every offset the peer can emit
        let decompressor = match window_bits {
            Some(bits) => Decompress::new_with_window_bits(false, bits.max(9)),
            None => Decompress::new(false),
        };
        Self {
            decompressor,
            out: PooledBuf::acquire(initial_capacity),
            written: 0,
            reset_context,
        }
    }

    /// Inflates one complete message and returns a view of the result. The
    /// view is valid until the next call.
    pub fn inflate(&mut self, payload: &[u8]) -> Result<&[u8], Error> {
        if self.reset_context {
            self.decompressor.reset(false);
        }
        self.written = 0;
        self.feed(payload)?;
        self.feed(&DEFLATE_TRAILER)?;
        Ok(self.output())
    }

    /// The region written by the last [`inflate`](Self::inflate) call.
    pub fn output(&self) -> &[u8] {
        &self.out[..self.written]
    }

    fn feed(&mut self, input: &[u8]) -> Result<(), Error> {
        let mut consumed = 0usize;
        loop {
            if consumed == input.len() {
                return Ok(());
            }
            if self.written == self.out.len() {
                self.grow();
            }

            let before_in = self.decompressor.total_in();
            let before_out = self.decompressor.total_out();
            let status = self
                .decompressor
                .decompress(
                    &input[consumed..],
                    &mut self.out[self.written..],
                    FlushDecompress::Sync,
                )
                .map_err(|_| Error::DecompressionFailed)?;
            let in_delta = (self.decompressor.total_in() - before_in) as usize;
            let out_delta = (self.decompressor.total_out() - before_out) as usize;
            consumed += in_delta;
            self.written += out_delta;

            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok => {}
                Status::BufError => {
                    // A full output region grows on the next iteration; a
                    // stall with space left means the input is corrupt.
                    if in_delta == 0 && out_delta == 0 && self.written < self.out.len() {
                        return Err(Error::DecompressionFailed);
                    }
                }
            }
        }
    }

    fn grow(&mut self) {
        let mut bigger = PooledBuf::acquire(self.out.len().max(1) * 2);
        bigger[..self.written].copy_from_slice(&self.out[..self.written]);
        self.out = bigger;
    }
}

/// One-shot self-check of the inflate backend: decode the canonical empty
/// raw-deflate stream. Ran once per process; a failure reports compression
/// as unavailable, which makes enabling it a connect-time error.
pub(crate) fn inflate_available() -> bool {
    static CHECK: OnceLock<bool> = OnceLock::new();
    *CHECK.get_or_init(|| {
        let mut decompressor = Decompress::new(false);
        let mut out = [0u8; 16];
        matches!(
            decompressor.decompress(&[0x03, 0x00], &mut out, FlushDecompress::Finish),
            Ok(Status::StreamEnd)
        )
    })
}
