use crate::error::{Error, ErrorKind};
use crate::extensions::NegotiatedCompression;
use crate::frame::{validate_close_code, OpCode, MAX_CONTROL_PAYLOAD};
use crate::inflate::Inflater;
use crate::options::ClientOptions;
use crate::pool::Assembler;
use crate::read::FrameReader;
use crate::stream::FeedFlowStream;
use crate::utils::with_cancel;
use crate::write::FrameWriter;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

type Reader = FrameReader<ReadHalf<FeedFlowStream>>;
type Writer = FrameWriter<WriteHalf<FeedFlowStream>>;

/// Where the connection is in its life cycle. Observable at any time via
/// [`WsClient::state`]; transitions happen on the receive path and on the
/// explicit close calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Open,
    CloseSent,
    CloseReceived,
    Closed,
    Aborted,
}

impl ClientState {
    fn from_u8(value: u8) -> ClientState {
        match value {
            0 => ClientState::Open,
            1 => ClientState::CloseSent,
            2 => ClientState::CloseReceived,
            3 => ClientState::Closed,
            _ => ClientState::Aborted,
        }
    }
}

/// A remote close, parsed: two big-endian code bytes when present, the rest
/// of the payload as a UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: Option<u16>,
    pub reason: String,
}

/// What one `receive` call delivers: a complete application message, or the
/// remote close that ended the conversation.
pub enum Received<'a> {
    Message(MessageRef<'a>),
    Close(CloseFrame),
}

impl std::fmt::Debug for Received<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Received::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Received::Close(c) => f.debug_tuple("Close").field(c).finish(),
        }
    }
}

/// A borrowed view of the last received message. The payload aliases the
/// client's receive buffers, which is what keeps the hot path free of
/// per-message allocation; the borrow ends at the next `receive`.
pub struct MessageRef<'a> {
    guard: MutexGuard<'a, RecvState>,
    opcode: OpCode,
    inflated: bool,
}

impl std::fmt::Debug for MessageRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRef")
            .field("opcode", &self.opcode)
            .field("inflated", &self.inflated)
            .field("payload", &self.payload())
            .finish()
    }
}

impl MessageRef<'_> {
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        match (self.inflated, self.guard.inflater.as_ref()) {
            (true, Some(inflater)) => inflater.output(),
            _ => self.guard.message.as_slice(),
        }
    }

    pub fn as_text(&self) -> Result<&str, Error> {
        Ok(std::str::from_utf8(self.payload())?)
    }
}

struct RecvState {
    reader: Reader,
    message: Assembler,
    control: Assembler,
    inflater: Option<Inflater>,
}

enum RecvOutcome {
    Message { opcode: OpCode, inflated: bool },
    Close(CloseFrame),
}

/// An established WebSocket client connection.
///
/// Send and receive are independent paths: everything outbound (user sends,
/// auto-pongs, close echoes, keep-alive pings) serializes on one internal
/// send lock, while reads happen only inside `receive`. All methods take
/// `&self`, so the client can sit in an `Arc` shared between a receive loop
/// and senders.
pub struct WsClient {
    // the send lock; frame boundaries on the wire follow its acquisition order
    writer: Arc<Mutex<Writer>>,
    recv: Mutex<RecvState>,
    state: AtomicU8,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    // teardown latch; the first task to set it disposes the transport
    closing: AtomicBool,
    negotiated: NegotiatedCompression,
    auto_pong: bool,
    max_message_bytes: usize,
    tls: bool,
    cancel: CancellationToken,
    pinger_cancel: CancellationToken,
}

impl WsClient {
    pub(crate) fn new(
        stream: FeedFlowStream,
        options: &ClientOptions,
        negotiated: NegotiatedCompression,
        cancel: CancellationToken,
    ) -> Self {
        let tls = stream.is_tls();
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(FrameWriter::new(write_half, options)));
        let inflater = negotiated.enabled.then(|| {
            Inflater::new(
                negotiated.server_no_context_takeover,
                negotiated.server_max_window_bits,
                options.inflate_buffer_size,
            )
        });
        let recv = Mutex::new(RecvState {
            reader: FrameReader::new(read_half, options),
            message: Assembler::with_capacity(options.message_buffer_size),
            control: Assembler::with_capacity(options.control_buffer_size),
            inflater,
        });

        let pinger_cancel = cancel.child_token();
        if let Some(period) = options.ping_interval {
            spawn_pinger(
                Arc::clone(&writer),
                period,
                options.ping_payload.clone(),
                pinger_cancel.clone(),
                cancel.clone(),
            );
        }

        WsClient {
            writer,
            recv,
            state: AtomicU8::new(ClientState::Open as u8),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            negotiated,
            auto_pong: options.auto_pong_on_ping,
            max_message_bytes: options.max_message_bytes,
            tls,
            cancel,
            pinger_cancel,
        }
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the transport was established over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// The compression parameter set agreed during the handshake.
    pub fn negotiated(&self) -> &NegotiatedCompression {
        &self.negotiated
    }

    /// Delivers the next complete application message, or the remote close.
    ///
    /// Control frames arriving between data fragments are dispatched
    /// internally (pings answered, pongs absorbed) and never surface here.
    /// At most one receive may be in flight; a second concurrent call fails
    /// with [`Error::ReceiveInProgress`]. The returned view stays valid
    /// until the next call that enters the receive path.
    pub async fn receive(&self) -> Result<Received<'_>, Error> {
        if self.closing.load(Ordering::Acquire)
            || matches!(self.state(), ClientState::Closed | ClientState::Aborted)
        {
            return Err(Error::ConnectionClosed);
        }
        let mut recv = self.recv.try_lock().map_err(|_| Error::ReceiveInProgress)?;

        match self.receive_message(&mut recv).await {
            Ok(RecvOutcome::Message { opcode, inflated }) => Ok(Received::Message(MessageRef {
                guard: recv,
                opcode,
                inflated,
            })),
            Ok(RecvOutcome::Close(frame)) => Ok(Received::Close(frame)),
            Err(err) => {
                // a protocol or transport failure poisons the framing; the
                // connection can't be trusted past this point
                if matches!(err.kind(), ErrorKind::Protocol | ErrorKind::Transport) {
                    self.abort().await;
                }
                Err(err)
            }
        }
    }

    async fn receive_message(&self, recv: &mut RecvState) -> Result<RecvOutcome, Error> {
        recv.message.reset();
        let mut in_fragment = false;
        let mut compressed = false;
        let mut message_opcode = OpCode::Binary;

        loop {
            // cancellation is observed at frame boundaries, where the read
            // position is still consistent
            let header = with_cancel(&self.cancel, recv.reader.read_header()).await?;

            if header.opcode.is_control() {
                if header.rsv1 {
                    return Err(Error::RSVNotZero);
                }
                recv.control.reset();
                recv.reader.read_payload(&header, &mut recv.control).await?;
                match header.opcode {
                    OpCode::Ping => self.handle_ping(recv).await?,
                    OpCode::Pong => trace!("pong received, {} payload bytes", recv.control.len()),
                    _ => return Ok(RecvOutcome::Close(self.handle_close(recv).await?)),
                }
                continue;
            }

            match header.opcode {
                OpCode::Continue => {
                    if !in_fragment {
                        return Err(Error::InvalidContinuationFrame);
                    }
                    // rsv1 belongs to the first frame of a message only
                    if header.rsv1 {
                        return Err(Error::RSVNotZero);
                    }
                }
                _ => {
                    // a fresh Text or Binary frame can't interrupt a
                    // fragmented message in progress
                    if in_fragment {
                        return Err(Error::InvalidFrameFragmentation);
                    }
                    if header.rsv1 && !self.negotiated.enabled {
                        return Err(Error::RSVNotZero);
                    }
                    in_fragment = true;
                    compressed = header.rsv1;
                    message_opcode = header.opcode;
                }
            }

            recv.reader.read_payload(&header, &mut recv.message).await?;
            if recv.message.len() > self.max_message_bytes {
                return Err(Error::MaxMessageSize);
            }

            if header.final_fragment {
                let payload_view = if compressed {
                    match recv.inflater.as_mut() {
                        Some(inflater) => inflater.inflate(recv.message.as_slice())?,
                        None => return Err(Error::RSVNotZero),
                    }
                } else {
                    recv.message.as_slice()
                };
                // Text messages must be valid UTF-8 on delivery
                if message_opcode == OpCode::Text {
                    std::str::from_utf8(payload_view)?;
                }
                return Ok(RecvOutcome::Message {
                    opcode: message_opcode,
                    inflated: compressed,
                });
            }
        }
    }

    async fn handle_ping(&self, recv: &mut RecvState) -> Result<(), Error> {
        if !self.auto_pong {
            trace!("ping received, auto-pong disabled");
            return Ok(());
        }
        // a close must stay the last frame this client emits
        if self.close_sent.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut writer = self.lock_writer().await?;
        let result = writer
            .write_frame(true, OpCode::Pong, recv.control.as_slice(), &self.cancel)
            .await;
        self.finish_send(&mut writer, result).await
    }

    async fn handle_close(&self, recv: &mut RecvState) -> Result<CloseFrame, Error> {
        let frame = {
            let payload = recv.control.as_slice();
            match payload.len() {
                0 => CloseFrame {
                    code: None,
                    reason: String::new(),
                },
                1 => return Err(Error::InvalidCloseFramePayload),
                _ => CloseFrame {
                    code: Some(u16::from_be_bytes([payload[0], payload[1]])),
                    reason: std::str::from_utf8(&payload[2..])?.to_string(),
                },
            }
        };
        debug!("close received, code {:?}", frame.code);

        self.close_received.store(true, Ordering::Release);
        self.set_state(ClientState::CloseReceived);

        if !self.close_sent.swap(true, Ordering::AcqRel) {
            // echo the close payload back, once
            let mut writer = self.lock_writer().await?;
            if let Err(err) = writer
                .write_frame(true, OpCode::Close, recv.control.as_slice(), &self.cancel)
                .await
            {
                debug!("close echo failed: {}", err);
            }
        }

        self.set_state(ClientState::Closed);
        self.dispose().await;
        Ok(frame)
    }

    /// Sends one unfragmented data frame. Only Text and Binary are message
    /// opcodes; everything else is a usage error.
    pub async fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        if !matches!(opcode, OpCode::Text | OpCode::Binary) {
            return Err(Error::InvalidMessageOpcode);
        }
        self.ensure_sendable()?;
        let mut writer = self.lock_writer().await?;
        let result = writer
            .write_frame(true, opcode, payload, &self.cancel)
            .await;
        self.finish_send(&mut writer, result).await
    }

    pub async fn send_text(&self, data: &str) -> Result<(), Error> {
        self.send(OpCode::Text, data.as_bytes()).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<(), Error> {
        self.send(OpCode::Binary, data).await
    }

    pub async fn send_ping(&self, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::PingPayloadTooLarge(payload.len()));
        }
        self.ensure_sendable()?;
        let mut writer = self.lock_writer().await?;
        let result = writer
            .write_frame(true, OpCode::Ping, payload, &self.cancel)
            .await;
        self.finish_send(&mut writer, result).await
    }

    /// Emits the client's Close frame, after which nothing further can be
    /// sent. The connection stays readable until the server answers with
    /// its own close.
    pub async fn close_output(&self, code: Option<u16>, reason: &str) -> Result<(), Error> {
        if let Some(code) = code {
            validate_close_code(code)?;
            if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
                return Err(Error::CloseReasonTooLong(reason.len()));
            }
        } else if !reason.is_empty() {
            return Err(Error::CloseReasonWithoutCode);
        }

        if self.closing.load(Ordering::Acquire)
            || matches!(self.state(), ClientState::Closed | ClientState::Aborted)
        {
            return Err(Error::ConnectionClosed);
        }
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Err(Error::ClosingInProgress);
        }

        let mut payload = [0u8; MAX_CONTROL_PAYLOAD];
        let payload_len = match code {
            Some(code) => {
                payload[..2].copy_from_slice(&code.to_be_bytes());
                payload[2..2 + reason.len()].copy_from_slice(reason.as_bytes());
                2 + reason.len()
            }
            None => 0,
        };

        let mut writer = self.lock_writer().await?;
        let result = writer
            .write_frame(true, OpCode::Close, &payload[..payload_len], &self.cancel)
            .await;
        self.finish_send(&mut writer, result).await?;
        drop(writer);
        debug!("close sent, code {:?}", code);

        // the receive path may have won the race and already reached Closed
        let _ = self.state.compare_exchange(
            ClientState::Open as u8,
            ClientState::CloseSent as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    /// Tears the connection down: cancels the pinger, closes the transport
    /// and returns the pooled buffers as their owners drop. Idempotent; a
    /// graceful shutdown calls `close_output` and drains `receive` first.
    pub async fn close(&self) {
        if self.state() != ClientState::Aborted {
            self.set_state(ClientState::Closed);
        }
        self.dispose().await;
    }

    fn ensure_sendable(&self) -> Result<(), Error> {
        if self.closing.load(Ordering::Acquire)
            || matches!(self.state(), ClientState::Closed | ClientState::Aborted)
        {
            return Err(Error::ConnectionClosed);
        }
        // a close is the last frame this client emits
        if self.close_sent.load(Ordering::Acquire) {
            return Err(Error::ClosingInProgress);
        }
        Ok(())
    }

    async fn lock_writer(&self) -> Result<MutexGuard<'_, Writer>, Error> {
        with_cancel(&self.cancel, async { Ok(self.writer.lock().await) }).await
    }

    async fn finish_send(
        &self,
        writer: &mut MutexGuard<'_, Writer>,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                // an interrupted emission leaves the wire mid-frame; the
                // framing can no longer be trusted
                if writer.poisoned() {
                    self.abort_with(writer).await;
                }
                Err(err)
            }
        }
    }

    async fn abort(&self) {
        self.set_state(ClientState::Aborted);
        self.dispose().await;
    }

    // abort while already holding the send lock; taking it again would deadlock
    async fn abort_with(&self, writer: &mut Writer) {
        self.set_state(ClientState::Aborted);
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pinger_cancel.cancel();
        if let Err(err) = writer.shutdown().await {
            trace!("transport shutdown: {}", err);
        }
    }

    async fn dispose(&self) {
        // the first caller through the latch performs the teardown
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pinger_cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            trace!("transport shutdown: {}", err);
        }
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        // the pinger must not outlive the client
        self.pinger_cancel.cancel();
    }
}

/// Background keep-alive: ticks on the configured period and pings the
/// server. Cancellation is its only normal exit; its errors are swallowed
/// here and surface to the user through the next receive failure.
fn spawn_pinger(
    writer: Arc<Mutex<Writer>>,
    period: Duration,
    payload: Vec<u8>,
    token: CancellationToken,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let mut writer = writer.lock().await;
                    match writer.write_frame(true, OpCode::Ping, &payload, &cancel).await {
                        Ok(()) => trace!("keep-alive ping sent"),
                        Err(err) => {
                            debug!("keep-alive ping failed, stopping: {}", err);
                            break;
                        }
                    }
                }
            }
        }
    });
}
