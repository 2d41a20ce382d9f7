//! Egress Socket (ES): the outbound TCP stream opened on behalf of one
//! tunneled request.
//!
//! Construction is asynchronous: the caller gets a handle immediately in
//! `Connecting` state, and `connected`/`error` arrives later as an event.
//! Writes are queued and drained by a single task per socket (the mpsc
//! receiver is that drainer), matching the single-writer discipline
//! `tunnel/transport/websocket.rs` enforces on the WebSocket side with
//! `Arc<Mutex<WebSocketWrite<..>>>`.

use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Events delivered to the owning slot, strictly serialized (one socket, one
/// reader task emitting them in order).
#[derive(Debug)]
pub enum EgressEvent {
    Connected,
    Data(Bytes),
    /// The remote peer half-closed its write side (our read returned EOF)
    /// while the socket is still `Connected`. The write side may still be
    /// open; this does not by itself close the socket.
    Finish,
    /// Terminal; delivered at most once, after both halves have stopped.
    Closed,
    /// Delivered instead of `Connected` if the initial connect fails.
    Error(io::Error),
}

enum WriteCmd {
    Data(Bytes),
    Shutdown,
}

/// Handle to a connecting/connected egress socket. A slot owns exactly one.
pub struct EgressSocket {
    write_tx: mpsc::UnboundedSender<WriteCmd>,
    stop: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl EgressSocket {
    /// Initiates an outbound TCP connection to `address` ("host:port").
    /// Returns immediately; `Connected`/`Error` arrives on `events` once the
    /// connect attempt resolves.
    pub fn connect(address: String, events: mpsc::UnboundedSender<EgressEvent>) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel::<WriteCmd>();
        let stop = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run(address, events, write_rx, closed.clone(), stop.clone()));

        Self { write_tx, stop, closed }
    }

    /// Appends a chunk to the write queue. Discarded if the socket is
    /// already closed.
    pub fn write(&self, chunk: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.write_tx.send(WriteCmd::Data(chunk));
    }

    /// Best-effort half-close of the write side.
    pub fn shutdown_write(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.write_tx.send(WriteCmd::Shutdown);
    }

    /// Tears down the underlying stream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.notify_waiters();
    }
}

impl Drop for EgressSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    address: String,
    events: mpsc::UnboundedSender<EgressEvent>,
    write_rx: mpsc::UnboundedReceiver<WriteCmd>,
    closed: Arc<AtomicBool>,
    stop: Arc<Notify>,
) {
    let stream = match TcpStream::connect(&address).await {
        Ok(s) => s,
        Err(err) => {
            debug!("egress connect to {address} failed: {err}");
            let _ = events.send(EgressEvent::Error(err));
            closed.store(true, Ordering::Release);
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let _ = events.send(EgressEvent::Connected);

    let (read_half, write_half) = tokio::io::split(stream);

    let reader = tokio::spawn(read_loop(address.clone(), read_half, events.clone(), stop.clone()));
    let writer = tokio::spawn(write_loop(write_half, write_rx, stop));

    let _ = tokio::join!(reader, writer);
    closed.store(true, Ordering::Release);
    let _ = events.send(EgressEvent::Closed);
}

async fn read_loop(
    address: String,
    mut read_half: ReadHalf<TcpStream>,
    events: mpsc::UnboundedSender<EgressEvent>,
    stop: Arc<Notify>,
) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            res = read_half.read(&mut buf) => match res {
                Ok(0) => {
                    trace!("egress {address} read half finished");
                    let _ = events.send(EgressEvent::Finish);
                    break;
                }
                Ok(n) => {
                    let _ = events.send(EgressEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(err) => {
                    debug!("egress {address} read error: {err}");
                    let _ = events.send(EgressEvent::Error(err));
                    stop.notify_waiters();
                    break;
                }
            },
            _ = stop.notified() => break,
        }
    }
}

async fn write_loop(mut write_half: WriteHalf<TcpStream>, mut write_rx: mpsc::UnboundedReceiver<WriteCmd>, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            cmd = write_rx.recv() => match cmd {
                Some(WriteCmd::Data(chunk)) => {
                    if write_half.write_all(&chunk).await.is_err() {
                        stop.notify_waiters();
                        break;
                    }
                }
                Some(WriteCmd::Shutdown) => {
                    let _ = write_half.shutdown().await;
                }
                None => break,
            },
            _ = stop.notified() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_and_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let egress = EgressSocket::connect(addr.to_string(), tx);

        assert!(matches!(rx.recv().await.unwrap(), EgressEvent::Connected));
        egress.write(Bytes::from_static(b"ping"));

        match rx.recv().await.unwrap() {
            EgressEvent::Data(chunk) => assert_eq!(&chunk[..], b"ping"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failure_delivers_error() {
        // Bind then drop immediately: nothing listens on the freed port, so
        // the connect attempt should fail.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _egress = EgressSocket::connect(addr.to_string(), tx);
        match rx.recv().await.unwrap() {
            EgressEvent::Error(_) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_eof_emits_finish_then_close_emits_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let egress = EgressSocket::connect(addr.to_string(), tx);
        assert!(matches!(rx.recv().await.unwrap(), EgressEvent::Connected));
        assert!(matches!(rx.recv().await.unwrap(), EgressEvent::Finish));

        egress.close();
        assert!(matches!(rx.recv().await.unwrap(), EgressEvent::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let egress = EgressSocket::connect(addr.to_string(), tx);
        assert!(matches!(rx.recv().await.unwrap(), EgressEvent::Connected));

        egress.close();
        egress.close();
        assert!(matches!(rx.recv().await.unwrap(), EgressEvent::Closed));
    }
}
