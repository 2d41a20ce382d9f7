//! WebSocket transport for a tunnel: the split read/write halves produced by
//! accepting an HTTP upgrade to `/tun`.

pub mod websocket;

/// Initial outbound buffer capacity; grown on demand by
/// [`websocket::WebsocketTunnelWrite`].
pub const MAX_PACKET_LENGTH: usize = 64 * 1024;

/// Blanket bound satisfied by whatever socket type a tunnel's WebSocket runs
/// over: the real upgraded HTTP connection in production, or an in-memory
/// duplex stream in tests.
pub trait TunnelIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelIo for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static {}
