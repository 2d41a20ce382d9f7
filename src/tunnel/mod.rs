//! Tunnel (T): owns one WebSocket, one Request Table, the frame
//! encoder/decoder, the outbound write serializer, and the keepalive state.

pub mod transport;

use crate::egress::EgressEvent;
use crate::frame::{self, Command};
use crate::manager::TunnelManager;
use crate::slot::SlotEvent;
use crate::table::RequestTable;
use crate::tunnel::transport::websocket::{WebsocketTunnelRead, WebsocketTunnelWrite};
use crate::tunnel::transport::TunnelIo;
use bytes::BytesMut;
use fastwebsockets::WebSocket;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub type TunnelId = u64;

/// Default keepalive period, surfaced as configuration in `config.rs`.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);

/// More than this many un-ponged pings closes the tunnel.
const MAX_MISSED_PONGS: u32 = 3;

enum TunnelCommand {
    KeepaliveTick,
}

/// Handle stored by the `TunnelManager`; cheap to clone, used only to
/// deliver keepalive ticks into the tunnel's own task.
#[derive(Clone)]
pub struct TunnelHandle {
    id: TunnelId,
    cmd_tx: mpsc::UnboundedSender<TunnelCommand>,
    /// Count of requests the manager has handed this tunnel, used only for
    /// observability (`tracing` span fields, metrics-shaped logging).
    generation: Arc<AtomicU32>,
}

impl TunnelHandle {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Delivers one keepalive tick. A no-op if the tunnel's task has already
    /// exited (its command channel closed).
    pub fn keepalive_tick(&self) {
        let _ = self.cmd_tx.send(TunnelCommand::KeepaliveTick);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

/// `Open → Closing → Closed`, one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    Open,
    Closing,
    Closed,
}

struct Tunnel {
    id: TunnelId,
    manager: Arc<TunnelManager>,
    table: RequestTable,
    last_activity: Instant,
    waiting_ping: u32,
    state: TunnelState,
    /// Tunnel keeps a clone of its own event sender so the channel never
    /// observes "all senders dropped" merely because every slot is
    /// currently idle; without this, `event_rx.recv()` would return `None`
    /// the instant the last active egress socket finished, busy-looping the
    /// `tokio::select!` in `run`.
    event_tx: mpsc::UnboundedSender<SlotEvent>,
}

/// Accepts an already-upgraded WebSocket and spawns the tunnel's task. The
/// manager registers the returned handle before the task can possibly
/// observe a close, own task, own id.
pub fn spawn(
    manager: Arc<TunnelManager>,
    id: TunnelId,
    cap: usize,
    ws: WebSocket<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    keepalive_period: Duration,
) -> TunnelHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let tunnel = Tunnel {
        id,
        manager,
        table: RequestTable::new(cap),
        last_activity: Instant::now(),
        waiting_ping: 0,
        state: TunnelState::Open,
        event_tx: event_tx.clone(),
    };

    let (ws_read, ws_write) = transport::websocket::split(ws);

    // `trace_id` correlates this tunnel's log lines independently of the
    // plain integer `id` used for protocol purposes.
    let trace_id = Uuid::now_v7();
    tokio::spawn(
        tunnel
            .run(ws_read, ws_write, cmd_rx, event_rx, keepalive_period)
            .instrument(tracing::info_span!("tunnel", id, %trace_id)),
    );

    TunnelHandle {
        id,
        cmd_tx,
        generation: Arc::new(AtomicU32::new(0)),
    }
}

impl Tunnel {
    async fn run<S: TunnelIo>(
        mut self,
        mut ws_read: WebsocketTunnelRead<S>,
        mut ws_write: WebsocketTunnelWrite<S>,
        mut cmd_rx: mpsc::UnboundedReceiver<TunnelCommand>,
        mut event_rx: mpsc::UnboundedReceiver<SlotEvent>,
        keepalive_period: Duration,
    ) {
        info!("tunnel opened");
        loop {
            tokio::select! {
                frame = ws_read.read_frame() => {
                    match frame {
                        Ok(Some(bytes)) => {
                            self.last_activity = Instant::now();
                            self.handle_inbound(&bytes, &mut ws_write).await;
                        }
                        Ok(None) => {
                            debug!("websocket closed by peer");
                            break;
                        }
                        Err(err) => {
                            warn!("transport error: {err}");
                            break;
                        }
                    }
                }
                Some(event) = event_rx.recv() => {
                    self.handle_slot_event(event, &mut ws_write).await;
                }
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        TunnelCommand::KeepaliveTick => {
                            if !self.keepalive(keepalive_period, &mut ws_write).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.close(&mut ws_write).await;
    }

    async fn enqueue<S: TunnelIo>(&mut self, frame: BytesMut, ws_write: &mut WebsocketTunnelWrite<S>) {
        if self.state != TunnelState::Open {
            return;
        }
        if let Err(err) = ws_write.send_binary(&frame).await {
            warn!("websocket send failed: {err}");
            self.state = TunnelState::Closing;
        }
    }

    async fn handle_inbound<S: TunnelIo>(&mut self, msg: &[u8], ws_write: &mut WebsocketTunnelWrite<S>) {
        if msg.is_empty() {
            return;
        }
        let Some(cmd) = Command::from_u8(msg[0]) else {
            warn!("unknown command byte {}, dropping frame", msg[0]);
            return;
        };

        if cmd.is_request_range() {
            let Some((hdr, body)) = frame::parse_request_header(msg) else {
                warn!("malformed request-range frame, dropping");
                return;
            };
            match hdr.cmd {
                Command::ReqCreated => {
                    let Some(addr) = frame::parse_addr_block(body) else {
                        warn!(idx = hdr.idx, "ReqCreated with unknown address type, dropping");
                        return;
                    };
                    match self.table.alloc(hdr.idx, hdr.tag) {
                        Some(slot) => slot.proxy(addr, self.event_tx.clone()),
                        None => warn!(idx = hdr.idx, "ReqCreated on an already in-use or out-of-range slot"),
                    }
                }
                Command::ReqData => {
                    if let Some(slot) = self.table.get(hdr.idx, hdr.tag) {
                        slot.on_client_data(body);
                    }
                }
                Command::ReqClientFinished => {
                    if let Some(slot) = self.table.get(hdr.idx, hdr.tag) {
                        slot.on_client_finished();
                    }
                }
                Command::ReqClientClosed => {
                    self.table.free(hdr.idx, hdr.tag);
                }
                _ => warn!(cmd = ?hdr.cmd, "server received a server-only or reserved command, dropping"),
            }
            return;
        }

        match cmd {
            Command::Ping => {
                let pong = frame::encode_pong_from(msg);
                self.enqueue(pong, ws_write).await;
            }
            Command::Pong => {
                self.waiting_ping = 0;
            }
            Command::None => warn!("received reserved command 0, dropping"),
            _ => unreachable!("request-range commands are handled above"),
        }
    }

    async fn handle_slot_event<S: TunnelIo>(&mut self, ev: SlotEvent, ws_write: &mut WebsocketTunnelWrite<S>) {
        // A stale event from a slot that has since been freed/reallocated
        // under a new tag is dropped silently.
        if self.table.get(ev.idx, ev.tag).is_none() {
            return;
        }
        match ev.event {
            EgressEvent::Connected => {}
            EgressEvent::Data(chunk) => {
                let frame = frame::encode_request_frame(Command::ReqData, ev.idx, ev.tag, &chunk);
                self.enqueue(frame, ws_write).await;
            }
            EgressEvent::Finish => {
                let frame = frame::encode_request_frame(Command::ReqServerFinished, ev.idx, ev.tag, &[]);
                self.enqueue(frame, ws_write).await;
            }
            EgressEvent::Closed | EgressEvent::Error(_) => {
                let frame = frame::encode_request_frame(Command::ReqServerClosed, ev.idx, ev.tag, &[]);
                self.enqueue(frame, ws_write).await;
                self.table.free(ev.idx, ev.tag);
            }
        }
    }

    /// Returns `false` if the tunnel should close as a result of this tick.
    ///
    /// A tick only does something once `last_activity` is stale by more than
    /// `period`; on such a tick the missed-pong counter is bumped first, and
    /// only if it's still within budget is a `Ping` actually put on the wire.
    /// This is what makes pings land at P, 2P, 3P and the close land exactly
    /// on the 4th stale tick rather than one tick later.
    async fn keepalive<S: TunnelIo>(&mut self, period: Duration, ws_write: &mut WebsocketTunnelWrite<S>) -> bool {
        if self.last_activity.elapsed() <= period {
            return true;
        }
        self.waiting_ping += 1;
        if self.waiting_ping > MAX_MISSED_PONGS {
            warn!(missed = self.waiting_ping, "keepalive exceeded, closing tunnel");
            return false;
        }
        let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64() * 1000.0;
        let ping = frame::encode_ping(now_ms);
        self.enqueue(ping, ws_write).await;
        true
    }

    async fn close<S: TunnelIo>(&mut self, ws_write: &mut WebsocketTunnelWrite<S>) {
        if self.state == TunnelState::Closed {
            return;
        }
        self.state = TunnelState::Closed;
        self.table.cleanup();
        let _ = ws_write.close().await;
        info!("tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.manager.on_tunnel_closed(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastwebsockets::{Frame, OpCode, Payload, Role};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Builds a real loopback `fastwebsockets` pair over an in-memory duplex
    /// stream: the server half split the same way `transport::websocket::split`
    /// splits a genuine HTTP upgrade, and a raw client half a test drives
    /// directly to feed frames in and read frames out.
    fn ws_pair() -> (WebsocketTunnelRead<DuplexStream>, WebsocketTunnelWrite<DuplexStream>, WebSocket<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(1 << 16);
        let server_ws = WebSocket::after_handshake(server_io, Role::Server);
        let client_ws = WebSocket::after_handshake(client_io, Role::Client);
        let (ws_read, ws_write) = transport::websocket::split(server_ws);
        (ws_read, ws_write, client_ws)
    }

    fn new_tunnel(cap: usize) -> (Tunnel, mpsc::UnboundedReceiver<SlotEvent>) {
        let manager = TunnelManager::new(cap, Duration::from_secs(3600));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let tunnel = Tunnel {
            id: 1,
            manager,
            table: RequestTable::new(cap),
            last_activity: Instant::now(),
            waiting_ping: 0,
            state: TunnelState::Open,
            event_tx,
        };
        (tunnel, event_rx)
    }

    /// Reads frames off the client side until one carries application data,
    /// skipping the close frame obligations `fastwebsockets` handles itself.
    async fn client_read_binary(client_ws: &mut WebSocket<DuplexStream>) -> Vec<u8> {
        loop {
            let frame = client_ws.read_frame().await.unwrap();
            match frame.opcode {
                OpCode::Binary | OpCode::Continuation => return frame.payload.as_ref().to_vec(),
                OpCode::Close => panic!("tunnel closed before sending the expected frame"),
                _ => continue,
            }
        }
    }

    /// A `ReqCreated` address block for `127.0.0.1:<port>` (IPv4, byte-reversed
    /// per the wire format `frame::parse_addr_block` expects).
    fn ipv4_addr_block(port: u16) -> Vec<u8> {
        let mut body = vec![0u8];
        body.extend_from_slice(&[1, 0, 0, 127]);
        body.extend_from_slice(&port.to_le_bytes());
        body
    }

    // Scenario 1: connect + echo through real frame dispatch, a real egress
    // TCP connection, and `Tunnel::run`'s own select loop.
    #[tokio::test]
    async fn connect_and_client_data_echo_round_trip_through_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let (ws_read, ws_write, mut client_ws) = ws_pair();
        let (tunnel, event_rx) = new_tunnel(4);
        // Kept alive so `cmd_rx.recv()` stays pending instead of immediately
        // resolving to `None` and spinning the tunnel's `select!` loop.
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(tunnel.run(ws_read, ws_write, cmd_rx, event_rx, Duration::from_secs(3600)));

        let created = frame::encode_request_frame(Command::ReqCreated, 0, 5, &ipv4_addr_block(addr.port()));
        client_ws.write_frame(Frame::binary(Payload::Owned(created.to_vec()))).await.unwrap();

        let data = frame::encode_request_frame(Command::ReqData, 0, 5, b"ping");
        client_ws.write_frame(Frame::binary(Payload::Owned(data.to_vec()))).await.unwrap();

        let echoed = client_read_binary(&mut client_ws).await;
        let (hdr, body) = frame::parse_request_header(&echoed).unwrap();
        assert_eq!(hdr.cmd, Command::ReqData);
        assert_eq!(hdr.idx, 0);
        assert_eq!(hdr.tag, 5);
        assert_eq!(body, b"ping");
    }

    // Scenario 3: a server-side egress close is delivered as a
    // `ReqServerClosed` frame and frees the slot.
    #[tokio::test]
    async fn egress_closed_event_emits_req_server_closed_and_frees_the_slot() {
        let (_ws_read, mut ws_write, mut client_ws) = ws_pair();
        let (mut tunnel, _event_rx) = new_tunnel(4);

        let _ = tunnel.table.alloc(0, 5);
        tunnel
            .handle_slot_event(SlotEvent { idx: 0, tag: 5, event: EgressEvent::Closed }, &mut ws_write)
            .await;

        assert!(tunnel.table.get(0, 5).is_none());

        let closed = client_read_binary(&mut client_ws).await;
        let (hdr, body) = frame::parse_request_header(&closed).unwrap();
        assert_eq!(hdr.cmd, Command::ReqServerClosed);
        assert_eq!(hdr.idx, 0);
        assert_eq!(hdr.tag, 5);
        assert!(body.is_empty());
    }

    // Scenario 4: a stale frame addressed to a freed slot's old tag is
    // dropped silently, and a fresh `ReqCreated` cleanly reallocates the idx.
    #[tokio::test]
    async fn stale_frame_after_free_is_dropped_and_idx_reallocates_under_new_tag() {
        let (_ws_read, mut ws_write, _client_ws) = ws_pair();
        let (mut tunnel, _event_rx) = new_tunnel(4);

        let _ = tunnel.table.alloc(0, 5);
        tunnel.table.free(0, 5);

        let stale = frame::encode_request_frame(Command::ReqData, 0, 5, b"stale");
        tunnel.handle_inbound(&stale, &mut ws_write).await;
        assert!(tunnel.table.get(0, 5).is_none());

        let recreated = frame::encode_request_frame(Command::ReqCreated, 0, 6, &ipv4_addr_block(0));
        tunnel.handle_inbound(&recreated, &mut ws_write).await;

        let slot = tunnel.table.get(0, 6).expect("idx 0 should reallocate cleanly under the new tag");
        assert_eq!(slot.tag, 6);
        assert!(tunnel.table.get(0, 5).is_none());
    }

    // Scenario 5: keepalive pings once per stale tick and closes once the
    // 4th consecutive tick still finds no activity.
    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_every_period_then_closes_on_the_fourth_missed_pong() {
        let (_ws_read, mut ws_write, mut client_ws) = ws_pair();
        let (mut tunnel, _event_rx) = new_tunnel(4);
        let period = Duration::from_secs(10);
        // A tiny margin over `period` stands in for a real ticker, whose
        // tick always lands at-or-after its scheduled instant, never before.
        let tick = period + Duration::from_millis(1);

        for expected in 1..=3u32 {
            tokio::time::advance(tick).await;
            assert!(tunnel.keepalive(period, &mut ws_write).await);
            assert_eq!(tunnel.waiting_ping, expected);

            let ping = client_read_binary(&mut client_ws).await;
            assert_eq!(Command::from_u8(ping[0]), Some(Command::Ping));
        }

        tokio::time::advance(tick).await;
        assert!(!tunnel.keepalive(period, &mut ws_write).await);
        assert_eq!(tunnel.waiting_ping, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_is_a_noop_before_the_period_elapses() {
        let (_ws_read, mut ws_write, _client_ws) = ws_pair();
        let (mut tunnel, _event_rx) = new_tunnel(4);
        let period = Duration::from_secs(10);

        tokio::time::advance(period / 2).await;
        assert!(tunnel.keepalive(period, &mut ws_write).await);
        assert_eq!(tunnel.waiting_ping, 0);
    }
}
