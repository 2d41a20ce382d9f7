//! Server-side WebSocket transport: accepts the HTTP upgrade to `/tun` and
//! exposes a split read/write pair framed as raw binary messages.
//!
//! Uses the same `fastwebsockets` split-socket shape as a dialing client
//! would (`Arc<Mutex<WebSocketWrite<..>>>` shared between the read loop,
//! which needs it for obligated WS-level `Pong` replies, and the write
//! side) and the same buffer-growth write path, but this side only ever
//! accepts an inbound upgrade — no JWT/auth/client-config dialing here.
//! Transport-level WS pings are answered automatically by `fastwebsockets`;
//! the tunnel protocol's own `Ping`/`Pong` command bytes are a distinct,
//! application-level concept owned by `Tunnel::keepalive`, not this module.

use crate::tunnel::transport::{TunnelIo, MAX_PACKET_LENGTH};
use bytes::{Bytes, BytesMut};
use fastwebsockets::upgrade::{self, UpgradeFut};
use fastwebsockets::{Frame, OpCode, Payload, WebSocketError, WebSocketRead, WebSocketWrite};
use futures_util::lock::Mutex;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::io;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tracing::trace;

/// Performs the HTTP→WebSocket upgrade handshake for a request already
/// routed to `/tun`. The caller returns the `Response` to the client and
/// awaits `UpgradeFut` (in a spawned task) to obtain the raw WebSocket.
pub fn upgrade(req: &mut Request<Incoming>) -> Result<(Response<Empty<Bytes>>, UpgradeFut), WebSocketError> {
    upgrade::upgrade(req)
}

pub struct WebsocketTunnelWrite<S> {
    inner: Arc<Mutex<WebSocketWrite<WriteHalf<S>>>>,
    buf: BytesMut,
}

impl<S: TunnelIo> WebsocketTunnelWrite<S> {
    fn new(inner: Arc<Mutex<WebSocketWrite<WriteHalf<S>>>>) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(MAX_PACKET_LENGTH),
        }
    }

    /// Sends one binary frame containing exactly `bytes`.
    pub async fn send_binary(&mut self, bytes: &[u8]) -> Result<(), io::Error> {
        self.buf.clear();
        self.buf.extend_from_slice(bytes);
        let len = self.buf.len();

        let ret = self
            .inner
            .lock()
            .await
            .write_frame(Frame::binary(Payload::BorrowedMut(&mut self.buf[..len])))
            .await;

        if let Err(err) = ret {
            return Err(io::Error::new(ErrorKind::ConnectionAborted, err));
        }

        // Grow the scratch buffer once it's saturated: amortizes allocation
        // under sustained throughput while clamping growth well below the
        // default 64Mb WS max frame size.
        const MAX_GROWTH: usize = 32 * 1024 * 1024;
        if self.buf.capacity() == len && self.buf.capacity() < MAX_GROWTH {
            let new_size = self.buf.capacity() + (self.buf.capacity() / 4);
            self.buf.reserve(new_size);
            trace!("grew ws write buffer to {new_size} bytes");
        }

        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), io::Error> {
        if let Err(err) = self.inner.lock().await.write_frame(Frame::close(1000, &[])).await {
            return Err(io::Error::new(ErrorKind::BrokenPipe, err));
        }
        Ok(())
    }
}

pub struct WebsocketTunnelRead<S> {
    ws_rx: WebSocketRead<ReadHalf<S>>,
    ws_tx: Arc<Mutex<WebSocketWrite<WriteHalf<S>>>>,
}

impl<S: TunnelIo> WebsocketTunnelRead<S> {
    fn new(ws_rx: WebSocketRead<ReadHalf<S>>, ws_tx: Arc<Mutex<WebSocketWrite<WriteHalf<S>>>>) -> Self {
        Self { ws_rx, ws_tx }
    }

    /// Reads the next application frame (the payload of one binary/text WS
    /// message). Returns `Ok(None)` on a clean WebSocket close.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, io::Error> {
        loop {
            let msg = match self
                .ws_rx
                .read_frame(&mut |frame| async { self.ws_tx.clone().lock().await.write_frame(frame).await })
                .await
            {
                Ok(msg) => msg,
                Err(err) => return Err(io::Error::new(ErrorKind::ConnectionAborted, err)),
            };

            trace!("received ws frame {:?} ({} bytes)", msg.opcode, msg.payload.len());
            match msg.opcode {
                OpCode::Continuation | OpCode::Text | OpCode::Binary => {
                    return Ok(Some(Bytes::copy_from_slice(msg.payload.as_ref())));
                }
                OpCode::Close => return Ok(None),
                // Handled internally via the closure passed to read_frame above.
                OpCode::Ping | OpCode::Pong => continue,
            }
        }
    }
}

/// Splits a freshly-upgraded WebSocket into a read half and a write half
/// that still share the same underlying sink, so the read loop can answer
/// WS-level pings while the tunnel's outbound drainer sends application
/// frames through the same connection.
pub fn split<S: TunnelIo>(mut ws: fastwebsockets::WebSocket<S>) -> (WebsocketTunnelRead<S>, WebsocketTunnelWrite<S>) {
    ws.set_auto_apply_mask(false);
    let (ws_rx, ws_tx) = ws.split(tokio::io::split);
    let ws_tx = Arc::new(Mutex::new(ws_tx));
    (WebsocketTunnelRead::new(ws_rx, ws_tx.clone()), WebsocketTunnelWrite::new(ws_tx))
}
