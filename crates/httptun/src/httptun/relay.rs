//! Per-session relay between a stream endpoint and a message endpoint.
//!
//! Three activities feed one coordinator over channels: the message reader,
//! the stream reader and the close notifier. The coordinator owns all writes
//! to the stream side and records exactly one terminal cause. Once it stops,
//! both endpoints are closed and every activity is awaited.

use std::{
    fmt,
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    time,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::httptun::endpoint::{
    self, CLOSE_TIMEOUT, Inbound, MessageReader, MessageWriter, StreamRead, StreamReader,
};
use crate::httptun::telemetry::SessionInfo;

const CHUNK_QUEUE: usize = 16;

/// The recognized ways a session can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationEvent {
    StreamReadError,
    StreamWriteError,
    MessageReadError,
    MessageWriteError,
    CloseEchoFailed,
    GracefulClose,
}

impl TerminationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationEvent::StreamReadError => "stream_read_error",
            TerminationEvent::StreamWriteError => "stream_write_error",
            TerminationEvent::MessageReadError => "message_read_error",
            TerminationEvent::MessageWriteError => "message_write_error",
            TerminationEvent::CloseEchoFailed => "close_echo_failed",
            TerminationEvent::GracefulClose => "graceful_close",
        }
    }
}

impl fmt::Display for TerminationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data-path failures. Each one terminates its session only.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stream read: {0}")]
    StreamRead(#[source] std::io::Error),

    #[error("stream write: {0}")]
    StreamWrite(#[source] std::io::Error),

    #[error("message read: {0}")]
    MessageRead(#[source] WsError),

    #[error("message write: {0}")]
    MessageWrite(#[source] WsError),

    #[error("close echo: {0}")]
    CloseEcho(#[source] WsError),
}

impl RelayError {
    pub fn event(&self) -> TerminationEvent {
        match self {
            RelayError::StreamRead(_) => TerminationEvent::StreamReadError,
            RelayError::StreamWrite(_) => TerminationEvent::StreamWriteError,
            RelayError::MessageRead(_) => TerminationEvent::MessageReadError,
            RelayError::MessageWrite(_) => TerminationEvent::MessageWriteError,
            RelayError::CloseEcho(_) => TerminationEvent::CloseEchoFailed,
        }
    }

    /// Whether the failure was observed on the remote leg of the tunnel.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            RelayError::MessageRead(_) | RelayError::MessageWrite(_) | RelayError::CloseEcho(_)
        )
    }
}

/// Why the session stopped relaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    /// The message peer sent a close frame.
    RemoteClose { code: Option<u16>, reason: String },
    /// The stream peer finished writing.
    StreamEof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCause {
    Graceful(Stop),
    LocalError {
        event: TerminationEvent,
        message: String,
    },
    RemoteError {
        event: TerminationEvent,
        message: String,
    },
}

impl TerminalCause {
    fn from_error(err: &RelayError) -> Self {
        let event = err.event();
        let message = err.to_string();
        if err.is_remote() {
            TerminalCause::RemoteError { event, message }
        } else {
            TerminalCause::LocalError { event, message }
        }
    }

    pub fn event(&self) -> TerminationEvent {
        match self {
            TerminalCause::Graceful(_) => TerminationEvent::GracefulClose,
            TerminalCause::LocalError { event, .. } | TerminalCause::RemoteError { event, .. } => {
                *event
            }
        }
    }

    pub fn is_graceful(&self) -> bool {
        matches!(self, TerminalCause::Graceful(_))
    }

    fn close_code(&self) -> CloseCode {
        if self.is_graceful() {
            CloseCode::Normal
        } else {
            CloseCode::Error
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Relaying,
    Closing,
    Closed,
}

/// Lifecycle bookkeeping of one session. The terminal cause is set once.
#[derive(Debug)]
pub struct Session {
    pub info: SessionInfo,
    state: SessionState,
    cause: Option<TerminalCause>,
    bytes_to_stream: u64,
    bytes_to_message: u64,
}

impl Session {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            state: SessionState::Established,
            cause: None,
            bytes_to_stream: 0,
            bytes_to_message: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn cause(&self) -> Option<&TerminalCause> {
        self.cause.as_ref()
    }

    /// Records the terminal cause. Later calls are ignored and return false.
    pub fn terminate(&mut self, cause: TerminalCause) -> bool {
        if self.cause.is_some() {
            return false;
        }
        self.cause = Some(cause);
        self.state = SessionState::Closing;
        true
    }

    fn start(&mut self) {
        if self.state == SessionState::Established {
            self.state = SessionState::Relaying;
        }
    }

    fn finish(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub cause: TerminalCause,
    pub bytes_to_stream: u64,
    pub bytes_to_message: u64,
    pub duration: Duration,
}

/// Signals for the coordinator, other than data.
enum Control {
    Stop(Stop),
    Error(RelayError),
}

/// Coordinator-side decision for one control signal.
///
/// An error that races a pending stop is residual noise of the shutdown.
fn settle(signal: Control, pending_stop: Option<Stop>) -> TerminalCause {
    match (signal, pending_stop) {
        (Control::Stop(stop), _) => TerminalCause::Graceful(stop),
        (Control::Error(_), Some(stop)) => TerminalCause::Graceful(stop),
        (Control::Error(err), None) => TerminalCause::from_error(&err),
    }
}

pub struct Relay<S, M> {
    session: Session,
    stream: S,
    message: WebSocketStream<M>,
}

impl<S, M> Relay<S, M>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    M: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(info: SessionInfo, stream: S, message: WebSocketStream<M>) -> Self {
        Self {
            session: Session::new(info),
            stream,
            message,
        }
    }

    /// Relays until the session terminates, then releases both endpoints.
    ///
    /// Returns after every activity has exited.
    pub async fn run(self) -> SessionReport {
        let Relay {
            mut session,
            stream,
            message,
        } = self;
        let started = Instant::now();

        let (stream_reader, stream_writer) = endpoint::stream_endpoint(stream);
        let (message_reader, message_writer) = endpoint::message_endpoint(message);

        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<Stop>();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<RelayError>();
        let (from_message_tx, mut from_message_rx) = mpsc::channel::<Bytes>(CHUNK_QUEUE);
        let (from_stream_tx, mut from_stream_rx) = mpsc::channel::<Bytes>(CHUNK_QUEUE);
        let (close_tx, close_rx) = oneshot::channel::<Option<CloseFrame<'static>>>();

        let message_task = tokio::spawn(read_messages(
            message_reader,
            from_message_tx,
            close_tx,
            err_tx.clone(),
        ));
        let stream_task = tokio::spawn(read_stream(
            stream_reader,
            from_stream_tx,
            stop_tx.clone(),
            err_tx.clone(),
        ));
        let notify_task = tokio::spawn(notify_close(
            session.info.id.clone(),
            close_rx,
            message_writer.clone(),
            stop_tx,
            err_tx.clone(),
        ));

        session.start();
        let sid = session.info.id.clone();
        let role = session.info.role;

        let cause = loop {
            tokio::select! {
                biased;

                Some(stop) = stop_rx.recv() => {
                    tracing::info!(sid = %sid, role = role, reason = ?stop, "relay: connection stopped");
                    break settle(Control::Stop(stop), None);
                }
                Some(err) = err_rx.recv() => {
                    let pending = stop_rx.try_recv().ok();
                    if let Some(stop) = &pending {
                        tracing::info!(sid = %sid, role = role, reason = ?stop, "relay: connection stopped");
                    } else {
                        tracing::warn!(sid = %sid, role = role, event = %err.event(), err = %err, "relay: error occurred");
                    }
                    break settle(Control::Error(err), pending);
                }
                Some(chunk) = from_message_rx.recv() => {
                    match stream_writer.write_chunk(&chunk).await {
                        Ok(()) => {
                            session.bytes_to_stream += chunk.len() as u64;
                            metrics::counter!("httptun_bytes_to_stream_total").increment(chunk.len() as u64);
                        }
                        Err(e) => {
                            let _ = err_tx.send(RelayError::StreamWrite(e));
                        }
                    }
                }
                Some(chunk) = from_stream_rx.recv() => {
                    let n = chunk.len() as u64;
                    match message_writer.send_chunk(chunk).await {
                        Ok(()) => {
                            session.bytes_to_message += n;
                            metrics::counter!("httptun_bytes_to_message_total").increment(n);
                        }
                        Err(e) => {
                            let _ = err_tx.send(RelayError::MessageWrite(e));
                        }
                    }
                }
                else => {
                    break TerminalCause::Graceful(Stop::StreamEof);
                }
            }
        };

        if cause.is_graceful() {
            // Chunks queued before the stop signal still belong to the session.
            while let Ok(chunk) = from_message_rx.try_recv() {
                if stream_writer.write_chunk(&chunk).await.is_err() {
                    break;
                }
                session.bytes_to_stream += chunk.len() as u64;
            }
            while let Ok(chunk) = from_stream_rx.try_recv() {
                let n = chunk.len() as u64;
                if message_writer.send_chunk(chunk).await.is_err() {
                    break;
                }
                session.bytes_to_message += n;
            }
        }

        let close_code = cause.close_code();
        session.terminate(cause);

        stream_writer.close().await;
        message_writer.close(close_code).await;
        drop(from_message_rx);
        drop(from_stream_rx);

        for (name, task) in [
            ("message reader", message_task),
            ("stream reader", stream_task),
            ("close notifier", notify_task),
        ] {
            if let Err(e) = task.await {
                tracing::warn!(sid = %sid, task = name, err = %e, "relay: activity panicked");
            }
        }
        session.finish();

        let cause = session
            .cause
            .take()
            .unwrap_or(TerminalCause::Graceful(Stop::StreamEof));
        metrics::counter!("httptun_session_terminations_total", "event" => cause.event().as_str())
            .increment(1);

        let report = SessionReport {
            cause,
            bytes_to_stream: session.bytes_to_stream,
            bytes_to_message: session.bytes_to_message,
            duration: started.elapsed(),
        };
        tracing::info!(
            sid = %sid,
            role = role,
            remote = %session.info.remote,
            event = %report.cause.event(),
            bytes_to_stream = report.bytes_to_stream,
            bytes_to_message = report.bytes_to_message,
            duration = %humantime::format_duration(Duration::from_millis(report.duration.as_millis() as u64)),
            "relay: session closed"
        );
        report
    }
}

async fn read_messages<M>(
    mut reader: MessageReader<M>,
    chunks: mpsc::Sender<Bytes>,
    close: oneshot::Sender<Option<CloseFrame<'static>>>,
    errors: mpsc::UnboundedSender<RelayError>,
) where
    M: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match reader.recv().await {
            Ok(Inbound::Chunk(chunk)) => {
                if chunks.send(chunk).await.is_err() {
                    return;
                }
            }
            Ok(Inbound::Close(frame)) => {
                let _ = close.send(frame);
                return;
            }
            Err(e) => {
                let _ = errors.send(RelayError::MessageRead(e));
                return;
            }
        }
    }
}

async fn read_stream<S>(
    mut reader: StreamReader<S>,
    chunks: mpsc::Sender<Bytes>,
    stop: mpsc::UnboundedSender<Stop>,
    errors: mpsc::UnboundedSender<RelayError>,
) where
    S: AsyncRead,
{
    loop {
        match reader.read_chunk().await {
            Ok(StreamRead::Chunk(chunk)) => {
                if chunks.send(chunk).await.is_err() {
                    return;
                }
            }
            Ok(StreamRead::Eof) => {
                let _ = stop.send(Stop::StreamEof);
                return;
            }
            Err(e) => {
                let _ = errors.send(RelayError::StreamRead(e));
                return;
            }
        }
    }
}

async fn notify_close<M>(
    sid: String,
    close: oneshot::Receiver<Option<CloseFrame<'static>>>,
    writer: MessageWriter<M>,
    stop: mpsc::UnboundedSender<Stop>,
    errors: mpsc::UnboundedSender<RelayError>,
) where
    M: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(frame) = close.await else {
        return;
    };

    let code = frame.as_ref().map(|f| u16::from(f.code));
    let reason = frame
        .as_ref()
        .map(|f| f.reason.to_string())
        .unwrap_or_default();
    let _ = stop.send(Stop::RemoteClose {
        code,
        reason: reason.clone(),
    });
    tracing::info!(sid = %sid, code = ?code, reason = %reason, "relay: disconnected");

    // The protocol layer already queued the reply mirroring the peer's frame;
    // a close in this state only flushes it.
    match time::timeout(CLOSE_TIMEOUT, writer.send_close(None)).await {
        Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {}
        Ok(Err(e)) => {
            let _ = errors.send(RelayError::CloseEcho(e));
        }
        Err(_) => {
            let _ = errors.send(RelayError::CloseEcho(WsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "close echo timed out",
            ))));
        }
    }
}
