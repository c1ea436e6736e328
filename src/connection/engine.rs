use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{FrameReader, FrameWriter, WebSocketCodec};
use crate::config::Config;
use crate::connection::keepalive::{KeepAliveAction, KeepAliveTimer};
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::{Assembled, Frame, FrameSequence, OpCode};

/// How long to wait for the server to confirm our close frame.
///
/// Also bounds how long a dropped engine's writer keeps trying to flush.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reports the outcome of one queued write.
pub type WriteReply = oneshot::Sender<Result<()>>;

/// What ended a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// We sent close first; the server confirmed it or the wait timed out.
    Local,
    /// The server sent close first.
    Peer,
    /// The stream ended or failed without a close handshake.
    Transport(Error),
    /// The server broke the framing rules; we closed with the mapped code.
    Protocol(Error),
    /// A ping went unanswered for a whole interval.
    KeepAlive,
}

/// Output of the engine for the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A complete text message.
    Text(String),
    /// A complete binary message.
    Binary(Vec<u8>),
    /// The connection is finished. The engine must be dropped.
    Closed {
        /// Code reported locally; may be 1005 or 1006.
        code: CloseCode,
        /// Why it ended.
        cause: CloseCause,
    },
}

struct Outbound {
    frame: Frame,
    reply: Option<WriteReply>,
}

/// Frame-level I/O for one established connection.
///
/// `ProtocolEngine` encodes outbound messages, reassembles inbound frames,
/// answers pings, runs the keepalive schedule and the close handshake.
/// Outbound frames are queued to a writer task, so no method except
/// [`read_frame`] waits on the network. The caller reads with
/// [`read_frame`], feeds the result to [`handle_read`], and calls
/// [`on_deadline`] when [`next_deadline`] passes.
///
/// Dropping the engine lets the writer flush what is queued, then shut the
/// stream down. A writer stuck on a peer that stopped reading gives up after
/// [`CLOSE_TIMEOUT`].
///
/// [`read_frame`]: ProtocolEngine::read_frame
/// [`handle_read`]: ProtocolEngine::handle_read
/// [`on_deadline`]: ProtocolEngine::on_deadline
/// [`next_deadline`]: ProtocolEngine::next_deadline
pub struct ProtocolEngine<T> {
    reader: FrameReader<ReadHalf<T>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    write_failed: Option<oneshot::Receiver<Error>>,
    writer: JoinHandle<()>,
    /// Dropped together with the engine; starts the writer's grace period.
    _attached: oneshot::Sender<()>,
    sequence: FrameSequence,
    keepalive: KeepAliveTimer,
    awaiting_close: bool,
    close_deadline: Option<Instant>,
    message_seq: u64,
}

impl<T> ProtocolEngine<T> {
    /// Returns `true` once our close frame is queued and we wait for the server.
    #[must_use]
    pub fn awaiting_close(&self) -> bool {
        self.awaiting_close
    }

    /// Number of data messages delivered on this connection.
    #[must_use]
    pub fn message_seq(&self) -> u64 {
        self.message_seq
    }

    /// The next instant at which [`on_deadline`](Self::on_deadline) must run.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.awaiting_close {
            self.close_deadline
        } else {
            self.keepalive.deadline()
        }
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub(crate) fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    /// Queue a message as a single final frame. `reply` receives the outcome
    /// once the frame is written.
    ///
    /// ## Errors
    ///
    /// Reported through `reply` without touching the stream:
    /// - `Error::ConnectionClosed` once the close handshake has started
    /// - `Error::ControlFrameTooLarge` for a ping/pong over 125 bytes
    pub fn send(&mut self, message: Message, reply: WriteReply) {
        if self.awaiting_close {
            let _ = reply.send(Err(Error::ConnectionClosed(None)));
            return;
        }

        let frame = match message {
            Message::Text(text) => Frame::text(text.into_bytes()),
            Message::Binary(data) => Frame::binary(data),
            Message::Ping(data) => Frame::ping(data),
            Message::Pong(data) => Frame::pong(data),
        };
        if let Err(e) = frame.validate() {
            let _ = reply.send(Err(e));
            return;
        }
        self.queue(frame, Some(reply));
    }

    /// Start the close handshake with `code`.
    ///
    /// 1005 and 1006 are sent as 1000. Further sends are refused and the
    /// keepalive stops. Does nothing if a close is already pending.
    ///
    /// ## Errors
    ///
    /// `Error::ConnectionClosed` if the writer has already stopped.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if self.awaiting_close {
            return Ok(());
        }
        self.awaiting_close = true;
        self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
        self.keepalive.disarm();
        self.sequence.reset();

        debug!(code = code.as_u16(), wire = code.wire_code(), "sending close");
        if self.queue(Frame::close(Some(code.wire_code()), reason), None) {
            Ok(())
        } else {
            Err(Error::ConnectionClosed(None))
        }
    }

    /// Drop the engine and wait for the writer to flush and shut down.
    pub async fn finish(self) {
        let Self {
            outbound,
            writer,
            _attached,
            ..
        } = self;
        drop(outbound);
        drop(_attached);
        if let Err(e) = writer.await {
            trace!(error = %e, "writer task failed");
        }
    }

    /// Process the outcome of [`read_frame`](Self::read_frame).
    pub fn handle_read(&mut self, read: Result<Frame>) -> Option<EngineEvent> {
        let outcome = match read {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(event) => event,
            Err(e) => Some(self.fail(e)),
        }
    }

    /// Run the keepalive or close-wait deadline that just passed.
    pub fn on_deadline(&mut self) -> Option<EngineEvent> {
        if self.awaiting_close {
            debug!("close handshake timed out");
            return Some(EngineEvent::Closed {
                code: CloseCode::Abnormal,
                cause: CloseCause::Local,
            });
        }

        match self.keepalive.on_tick(Instant::now())? {
            KeepAliveAction::SendPing => {
                trace!("keepalive ping");
                if self.queue(Frame::ping(Vec::new()), None) {
                    None
                } else {
                    Some(self.transport_closed(Error::ConnectionClosed(None)))
                }
            }
            KeepAliveAction::TimedOut => {
                warn!("pong not received within the keepalive interval");
                if let Err(e) = self.close(CloseCode::Abnormal, "") {
                    trace!(error = %e, "close after keepalive timeout failed");
                }
                Some(EngineEvent::Closed {
                    code: CloseCode::Abnormal,
                    cause: CloseCause::KeepAlive,
                })
            }
        }
    }

    /// Hand a frame to the writer. Returns `false` if the writer is gone.
    fn queue(&self, frame: Frame, reply: Option<WriteReply>) -> bool {
        match self.outbound.send(Outbound { frame, reply }) {
            Ok(()) => true,
            Err(mpsc::error::SendError(outbound)) => {
                if let Some(reply) = outbound.reply {
                    let _ = reply.send(Err(Error::ConnectionClosed(None)));
                }
                false
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Option<EngineEvent>> {
        frame.validate()?;

        match frame.opcode {
            OpCode::Ping => {
                if !self.awaiting_close && !self.queue(Frame::pong(frame.into_payload()), None) {
                    return Err(Error::ConnectionClosed(None));
                }
                Ok(None)
            }
            OpCode::Pong => {
                trace!("pong received");
                self.keepalive.on_pong();
                Ok(None)
            }
            OpCode::Close => {
                let code = CloseFrame::parse(frame.payload())
                    .map_or(CloseCode::NoStatusReceived, |close| close.code);

                if self.awaiting_close {
                    debug!(code = code.as_u16(), "close confirmed by server");
                    return Ok(Some(EngineEvent::Closed {
                        code,
                        cause: CloseCause::Local,
                    }));
                }

                debug!(code = code.as_u16(), "server initiated close");
                if let Err(e) = self.close(code, "") {
                    trace!(error = %e, "close reply failed");
                }
                Ok(Some(EngineEvent::Closed {
                    code,
                    cause: CloseCause::Peer,
                }))
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                if self.awaiting_close {
                    return Ok(None);
                }
                match self.sequence.push(frame)? {
                    Some(assembled) => {
                        self.message_seq += 1;
                        let event = match assembled {
                            Assembled::Text(text) => {
                                trace!(seq = self.message_seq, len = text.len(), "text message");
                                EngineEvent::Text(text)
                            }
                            Assembled::Binary(data) => {
                                trace!(seq = self.message_seq, len = data.len(), "binary message");
                                EngineEvent::Binary(data)
                            }
                        };
                        Ok(Some(event))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Turn a read or write error into the final event of this connection.
    fn fail(&mut self, error: Error) -> EngineEvent {
        if !error.is_protocol() {
            return self.transport_closed(error);
        }

        let code = error.close_code().unwrap_or(CloseCode::ProtocolError);
        warn!(error = %error, code = code.as_u16(), "protocol error");
        if let Err(e) = self.close(code, "") {
            trace!(error = %e, "close after protocol error failed");
        }
        EngineEvent::Closed {
            code,
            cause: CloseCause::Protocol(error),
        }
    }

    fn transport_closed(&mut self, error: Error) -> EngineEvent {
        if self.awaiting_close {
            return EngineEvent::Closed {
                code: CloseCode::Abnormal,
                cause: CloseCause::Local,
            };
        }
        debug!(error = %error, "transport closed");
        self.awaiting_close = true;
        EngineEvent::Closed {
            code: CloseCode::Abnormal,
            cause: CloseCause::Transport(error),
        }
    }
}

impl<T> ProtocolEngine<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an upgraded stream and spawn its writer. The keepalive schedule
    /// starts now.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(codec: WebSocketCodec<T>, config: &Config) -> Self {
        let (reader, writer) = codec.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = oneshot::channel();
        let (attached, detached) = oneshot::channel();
        let writer = tokio::spawn(write_loop(writer, queue, failed_tx, detached));

        Self {
            reader,
            outbound,
            write_failed: Some(failed_rx),
            writer,
            _attached: attached,
            sequence: FrameSequence::new(config.limits.clone()),
            keepalive: KeepAliveTimer::new(config.ping_interval, Instant::now()),
            awaiting_close: false,
            close_deadline: None,
            message_seq: 0,
        }
    }

    /// Read the next frame, or the error that stopped the writer. Cancel safe.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        tokio::select! {
            read = self.reader.read_frame() => read,
            error = write_failure(&mut self.write_failed) => Err(error),
        }
    }
}

async fn write_failure(slot: &mut Option<oneshot::Receiver<Error>>) -> Error {
    if let Some(failed) = slot.as_mut() {
        let outcome = failed.await;
        *slot = None;
        if let Ok(error) = outcome {
            return error;
        }
    }
    std::future::pending().await
}

/// Write queued frames in order until the engine is dropped.
///
/// The first failed write is reported through `failed` and ends the task.
/// Once `detached` fires the queue is drained within [`CLOSE_TIMEOUT`].
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    failed: oneshot::Sender<Error>,
    detached: oneshot::Receiver<()>,
) {
    let abandon = async move {
        let _ = detached.await;
        tokio::time::sleep(CLOSE_TIMEOUT).await;
    };
    tokio::pin!(abandon);

    let drained = async move {
        while let Some(Outbound { frame, reply }) = queue.recv().await {
            match writer.send(&frame).await {
                Ok(()) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "write failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e.clone()));
                    }
                    let _ = failed.send(e);
                    return;
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            trace!(error = %e, "shutdown failed");
        }
    };

    tokio::select! {
        () = drained => {}
        () = &mut abandon => debug!("writer gave up on a stalled stream"),
    }
}
