//! The two legs of a session.
//!
//! Both endpoints are split into a reader owned by one activity and a cloneable
//! writer. Closing is idempotent and wakes a reader blocked on its read
//! primitive, so activities unwind without polling.

use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, watch},
    time,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError, Message,
        protocol::{CloseFrame, WebSocketConfig, frame::coding::CloseCode},
    },
};

/// Upper bound for one chunk read from the stream side.
pub const READ_BUFFER_SIZE: usize = 10 * 1024;

/// Bound for the close handshake of either endpoint.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Frame transport settings shared by both roles.
pub fn websocket_config() -> WebSocketConfig {
    let mut cfg = WebSocketConfig::default();
    cfg.write_buffer_size = READ_BUFFER_SIZE;
    cfg
}

#[derive(Clone)]
struct CloseFlag(Arc<watch::Sender<bool>>);

impl CloseFlag {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self(Arc::new(tx)), rx)
    }

    /// Returns true only for the call that actually closed.
    fn close(&self) -> bool {
        !self.0.send_replace(true)
    }

    fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}

fn endpoint_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "endpoint closed")
}

pub fn stream_endpoint<S>(io: S) -> (StreamReader<S>, StreamWriter<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(io);
    let (flag, rx) = CloseFlag::new();
    (
        StreamReader {
            half: r,
            closed: rx,
            buf: Box::new([0u8; READ_BUFFER_SIZE]),
        },
        StreamWriter {
            half: Arc::new(Mutex::new(w)),
            closed: flag,
        },
    )
}

pub enum StreamRead {
    Chunk(Bytes),
    Eof,
}

pub struct StreamReader<S> {
    half: ReadHalf<S>,
    closed: watch::Receiver<bool>,
    buf: Box<[u8; READ_BUFFER_SIZE]>,
}

impl<S: AsyncRead> StreamReader<S> {
    /// Reads up to [`READ_BUFFER_SIZE`] bytes. Fails once the endpoint is closed.
    pub async fn read_chunk(&mut self) -> io::Result<StreamRead> {
        if *self.closed.borrow() {
            return Err(endpoint_closed());
        }
        let n = tokio::select! {
            _ = closed(&mut self.closed) => return Err(endpoint_closed()),
            res = self.half.read(&mut self.buf[..]) => res?,
        };
        if n == 0 {
            return Ok(StreamRead::Eof);
        }
        Ok(StreamRead::Chunk(Bytes::copy_from_slice(&self.buf[..n])))
    }
}

pub struct StreamWriter<S> {
    half: Arc<Mutex<WriteHalf<S>>>,
    closed: CloseFlag,
}

impl<S> Clone for StreamWriter<S> {
    fn clone(&self) -> Self {
        Self {
            half: self.half.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<S: AsyncWrite> StreamWriter<S> {
    pub async fn write_chunk(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.is_closed() {
            return Err(endpoint_closed());
        }
        let mut w = self.half.lock().await;
        w.write_all(data).await?;
        w.flush().await
    }

    /// Closes the endpoint; only the first call has an effect.
    pub async fn close(&self) -> bool {
        if !self.closed.close() {
            return false;
        }
        let _ = time::timeout(CLOSE_TIMEOUT, async {
            let mut w = self.half.lock().await;
            let _ = w.shutdown().await;
        })
        .await;
        true
    }
}

type WsSink<M> = SplitSink<WebSocketStream<M>, Message>;

pub fn message_endpoint<M>(ws: WebSocketStream<M>) -> (MessageReader<M>, MessageWriter<M>)
where
    M: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    let (flag, rx) = CloseFlag::new();
    (
        MessageReader { stream, closed: rx },
        MessageWriter {
            sink: Arc::new(Mutex::new(sink)),
            closed: flag,
        },
    )
}

#[derive(Debug)]
pub enum Inbound {
    Chunk(Bytes),
    Close(Option<CloseFrame<'static>>),
}

pub struct MessageReader<M> {
    stream: SplitStream<WebSocketStream<M>>,
    closed: watch::Receiver<bool>,
}

impl<M> MessageReader<M>
where
    M: AsyncRead + AsyncWrite + Unpin,
{
    /// Waits for the next data or close frame. Control frames are handled by
    /// the protocol layer and skipped here.
    pub async fn recv(&mut self) -> Result<Inbound, WsError> {
        loop {
            if *self.closed.borrow() {
                return Err(WsError::AlreadyClosed);
            }
            let next = tokio::select! {
                _ = closed(&mut self.closed) => return Err(WsError::AlreadyClosed),
                next = self.stream.next() => next,
            };
            match next {
                None => return Err(WsError::ConnectionClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Message::Binary(b))) => return Ok(Inbound::Chunk(Bytes::from(b))),
                Some(Ok(Message::Text(t))) => return Ok(Inbound::Chunk(Bytes::from(t))),
                Some(Ok(Message::Close(frame))) => return Ok(Inbound::Close(frame)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            }
        }
    }
}

pub struct MessageWriter<M> {
    sink: Arc<Mutex<WsSink<M>>>,
    closed: CloseFlag,
}

impl<M> Clone for MessageWriter<M> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<M> MessageWriter<M>
where
    M: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends one chunk as one binary frame.
    pub async fn send_chunk(&self, chunk: Bytes) -> Result<(), WsError> {
        if self.closed.is_closed() {
            return Err(WsError::AlreadyClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(Vec::from(chunk))).await
    }

    /// Sends a close frame without closing the endpoint.
    pub async fn send_close(&self, frame: Option<CloseFrame<'static>>) -> Result<(), WsError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(frame)).await
    }

    /// Starts the close handshake with `code`, bounded by [`CLOSE_TIMEOUT`].
    /// Only the first call has an effect.
    pub async fn close(&self, code: CloseCode) -> bool {
        if !self.closed.close() {
            return false;
        }
        let _ = time::timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "".into(),
                })))
                .await;
            let _ = sink.close().await;
        })
        .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn stream_reads_are_bounded_by_buffer_size() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let (mut reader, _writer) = stream_endpoint(a);

        b.write_all(&vec![7u8; READ_BUFFER_SIZE + 100]).await.expect("write");

        let mut total = 0;
        while total < READ_BUFFER_SIZE + 100 {
            match reader.read_chunk().await.expect("read") {
                StreamRead::Chunk(c) => {
                    assert!(c.len() <= READ_BUFFER_SIZE);
                    total += c.len();
                }
                StreamRead::Eof => panic!("unexpected eof"),
            }
        }

        drop(b);
        assert!(matches!(reader.read_chunk().await, Ok(StreamRead::Eof)));
    }

    #[tokio::test]
    async fn stream_close_is_idempotent_and_unblocks_reader() {
        let (a, _b) = tokio::io::duplex(1024);
        let (mut reader, writer) = stream_endpoint(a);

        let pending = tokio::spawn(async move { reader.read_chunk().await });
        tokio::task::yield_now().await;

        assert!(writer.close().await);
        assert!(!writer.close().await);

        let res = time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("reader unblocked")
            .expect("join");
        assert!(res.is_err());
        assert!(writer.write_chunk(b"late").await.is_err());
    }

    #[tokio::test]
    async fn message_close_is_idempotent_and_sends_code() {
        let (server, mut client) = ws_pair().await;
        let (mut reader, writer) = message_endpoint(server);

        assert!(writer.close(CloseCode::Normal).await);
        assert!(!writer.close(CloseCode::Error).await);

        match client.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }

        let res = time::timeout(Duration::from_secs(1), reader.recv())
            .await
            .expect("reader unblocked");
        assert!(matches!(res, Err(WsError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn message_reader_maps_frames_to_chunks() {
        let (server, mut client) = ws_pair().await;
        let (mut reader, _writer) = message_endpoint(server);

        client.send(Message::Ping(vec![1])).await.expect("ping");
        client.send(Message::Text("hi".into())).await.expect("text");
        client.send(Message::Binary(vec![9, 8])).await.expect("binary");

        assert!(matches!(reader.recv().await, Ok(Inbound::Chunk(c)) if c.as_ref() == b"hi"));
        assert!(matches!(reader.recv().await, Ok(Inbound::Chunk(c)) if c.as_ref() == [9, 8]));
    }
}
